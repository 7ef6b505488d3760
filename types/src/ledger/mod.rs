mod balance;
mod constants;
mod transaction;

pub use balance::*;
pub use constants::*;
pub use transaction::*;
