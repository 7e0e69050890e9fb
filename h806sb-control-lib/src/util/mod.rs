pub mod discovery;
pub mod listen_port;
pub mod packet;
pub mod serial;
