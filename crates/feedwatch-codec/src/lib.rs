//! feedwatch wire codec primitives.
//!
//! Defines the typed message model exchanged with a provider and the CBOR
//! encode/decode helpers used on the wire.

pub mod error;
pub mod msg;
pub mod payload;
pub mod wire;

pub use error::CodecError;
pub use msg::{
    AckMsg, CloseMsg, GenericMsg, Msg, MsgClass, MsgKey, NakCode, PostMsg, RefreshMsg,
    RequestMsg, StatusMsg, UpdateMsg, View,
};
pub use payload::{
    LoginAttribs, MapAction, Payload, ServiceEntry, ServiceGroup, ServiceInfo, ServiceLink,
    ServiceLoad, ServiceStatus, SymbolEntry, SymbolListBehavior,
};
pub use wire::{decode_msg_cbor, encode_msg_cbor};
