pub mod messages;
pub mod offer_gate;
pub mod peer_info;
pub mod tcp_transfer;
pub mod udp_service;
