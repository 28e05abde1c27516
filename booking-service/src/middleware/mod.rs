pub mod caller;

pub use caller::{CustomerContext, InternalCaller, MerchantContext};
