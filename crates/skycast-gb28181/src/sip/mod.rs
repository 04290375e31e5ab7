// GB28181 SIP 信令编解码
// 实现国标 GB/T 28181-2016 实际用到的 SIP 子集

pub mod framing;
pub mod message;

pub use framing::read_sip_frame;
pub use message::{
    extract_sip_uri, header_param, reason_phrase, sip_user, SipMessage, SipMethod, SipRequest,
    SipResponse,
};
