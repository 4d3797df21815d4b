use crate::error::CodecError;
use crate::msg::Msg;

/// Validates and encodes one message as CBOR.
pub fn encode_msg_cbor(msg: &Msg) -> Result<Vec<u8>, CodecError> {
    msg.validate()?;
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(msg, &mut bytes).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Decodes and validates one CBOR message.
pub fn decode_msg_cbor(bytes: &[u8]) -> Result<Msg, CodecError> {
    let msg: Msg =
        ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
    msg.validate()?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::{decode_msg_cbor, encode_msg_cbor};
    use crate::msg::{CloseMsg, Msg, MsgKey, RefreshMsg, RequestMsg, View};
    use crate::payload::{Payload, SymbolEntry};
    use feedwatch_core::{DomainType, GroupId, State};

    #[test]
    fn request_with_view_survives_wire() {
        let request = RequestMsg::new(5, DomainType::MARKET_PRICE, MsgKey::named("TRI.N"))
            .streaming()
            .with_priority(1, 2)
            .with_view(View::FieldIds(vec![22, 25]));
        let msg = Msg::Request(request);
        let bytes = encode_msg_cbor(&msg).expect("encode request");
        let decoded = decode_msg_cbor(&bytes).expect("decode request");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn symbol_map_refresh_survives_wire() {
        let mut refresh = RefreshMsg::new(6, DomainType::SYMBOL_LIST, State::open_ok());
        refresh.group_id = Some(GroupId::from_u16(3));
        refresh.payload = Payload::SymbolMap(vec![SymbolEntry::add("FB.O")]);
        let msg = Msg::Refresh(refresh);
        let decoded =
            decode_msg_cbor(&encode_msg_cbor(&msg).expect("encode")).expect("decode refresh");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn encode_rejects_invalid_message() {
        let close = Msg::Close(CloseMsg {
            stream_id: 5,
            domain: DomainType(0),
        });
        assert!(encode_msg_cbor(&close).is_err());
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode_msg_cbor(&[0xff, 0x00, 0x13]).expect_err("garbage must fail");
        assert!(err.to_string().starts_with("decode error"));
    }
}
