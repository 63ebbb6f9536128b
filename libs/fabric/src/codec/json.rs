use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::error::{Error, Result};

/// JSON codec, human readable mailbox files at the cost of size
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Codec(e.to_string()))
    }

    fn decode<T: for<'de> Deserialize<'de>>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::Codec(e.to_string()))
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{Envelope, MessageKind};

    #[test]
    fn json_envelope_roundtrip() {
        let env = Envelope::new("a", "b", MessageKind::Event, vec![7, 8, 9]).with_ttl(5);
        let bytes = JsonCodec.encode(&env).unwrap();
        let decoded: Envelope = JsonCodec.decode(&bytes).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let result: Result<Envelope> = JsonCodec.decode(b"not json");
        assert!(matches!(result, Err(Error::Codec(_))));
    }
}
