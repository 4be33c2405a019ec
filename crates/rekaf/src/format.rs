use crate::broker::RawMessage;
use crate::error::Error;

/// Embedded payload format declared when an instance is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddedFormat {
    #[default]
    Binary,
    Json,
}

/// One client-facing record of a read response.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ConsumerRecord {
    pub topic: String,
    pub key: serde_json::Value,
    pub value: serde_json::Value,
    pub partition: i32,
    pub offset: i64,
}

impl EmbeddedFormat {
    /// Decode `raw` into a client record plus its rough size: an
    /// over-approximation of the bytes the record will contribute to the
    /// HTTP response. Keys and values are summed at their encoded lengths;
    /// JSON framing is ignored, so overshoot is bounded by one record.
    pub fn make_record(&self, raw: &RawMessage) -> Result<(ConsumerRecord, usize), Error> {
        let (key, value, rough_size) = match self {
            EmbeddedFormat::Binary => {
                let key = raw.key.as_deref().map(base64::encode);
                let value = raw.value.as_deref().map(base64::encode);
                let rough_size = key.as_ref().map_or(0, String::len)
                    + value.as_ref().map_or(0, String::len);
                (
                    key.map_or(serde_json::Value::Null, serde_json::Value::String),
                    value.map_or(serde_json::Value::Null, serde_json::Value::String),
                    rough_size,
                )
            }
            EmbeddedFormat::Json => {
                let rough_size = raw.key.as_ref().map_or(0, Vec::len)
                    + raw.value.as_ref().map_or(0, Vec::len);
                (
                    parse_json(raw.key.as_deref())?,
                    parse_json(raw.value.as_deref())?,
                    rough_size,
                )
            }
        };

        Ok((
            ConsumerRecord {
                topic: raw.topic.clone(),
                key,
                value,
                partition: raw.partition,
                offset: raw.offset,
            },
            rough_size,
        ))
    }
}

fn parse_json(payload: Option<&[u8]>) -> Result<serde_json::Value, Error> {
    match payload {
        None => Ok(serde_json::Value::Null),
        Some(bytes) => serde_json::from_slice(bytes).map_err(|err| Error::Decode(err.to_string())),
    }
}
