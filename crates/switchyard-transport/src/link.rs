//! Conversions between core messages and tier-link envelopes.

use bytes::Bytes;
use switchyard_core::Message;
use switchyard_protocol::{frame, Envelope, Headers, ProtocolError};

/// Wrap a message into a `message` envelope carrying a routed frame.
///
/// # Errors
///
/// Returns an error if the route key does not fit in a frame.
pub fn to_envelope(message: &Message) -> Result<Envelope, ProtocolError> {
    let data = frame::encode(&message.route, message.payload())?;
    Ok(Envelope::message(message.headers.clone(), data))
}

/// Build a message from the headers and frame of a `message` envelope.
///
/// The payload is a slice of `data`, nothing is copied.
///
/// # Errors
///
/// Returns an error if `data` is not a valid frame.
pub fn from_envelope(headers: Headers, data: Bytes) -> Result<Message, ProtocolError> {
    let decoded = frame::decode(data)?;
    Ok(Message::new(headers, decoded.payload).with_route(decoded.metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_protocol::{keys, RouteMetadata};

    #[test]
    fn test_message_envelope_conversion() {
        let headers = Headers::new().with(keys::USER_ID, "u1");
        let message = Message::new(headers.clone(), b"body".to_vec())
            .with_route(RouteMetadata::logic("logic-2"));

        let Envelope::Message { headers: h, data } = to_envelope(&message).unwrap() else {
            panic!("Expected a message envelope");
        };
        let back = from_envelope(h, data).unwrap();
        assert_eq!(back.headers, headers);
        assert_eq!(back.route, RouteMetadata::logic("logic-2"));
        assert_eq!(&back.payload()[..], b"body");
    }

    #[test]
    fn test_garbage_frame_rejected() {
        assert!(from_envelope(Headers::new(), Bytes::from_static(&[0xff])).is_err());
    }
}
