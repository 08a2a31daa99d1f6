pub mod addr_struct;
pub mod packet_struct;

pub use addr_struct::*;
pub use packet_struct::*;
