//! Wire formats: TCP header codec, checksums and IPv4 frame splitting.

pub mod checksum;
pub mod ipv4;
pub mod tcp;

pub use checksum::{internet_checksum, tcp_checksum, verify_tcp_checksum};
pub use ipv4::{parse_tcp_datagram, Ipv4Frame};
pub use tcp::{CodecError, TcpHeader, TcpOption, ACK, FIN, PSH, RST, SYN, URG};
