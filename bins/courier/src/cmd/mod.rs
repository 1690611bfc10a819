pub mod bench;
pub mod publish;
pub mod replay;
