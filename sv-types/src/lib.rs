pub mod address;
pub mod hash;
pub mod header;
pub mod network;
pub mod script;
pub mod u256;

pub use address::{Address, AddressError};
pub use hash::{double_sha256, sha256, H256};
pub use header::{target_from_bits, DecodeHeaderError, ExtendedHeader, Header, Target, Work};
pub use network::{Checkpoint, Net, PowParams, MAINNET, TESTNET};
pub use u256::U256;
