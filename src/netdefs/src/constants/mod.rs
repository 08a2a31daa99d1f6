pub mod err_const;
pub mod net_const;

pub use err_const::*;
pub use net_const::*;
