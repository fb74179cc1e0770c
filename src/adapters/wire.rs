//! Scheduler wire protocol.
//!
//! Newline-delimited JSON over TCP. The client opens a session once, then
//! submits nodes by name; the scheduler answers each submission with a
//! `finished` reply once the node has run (or failed). Outputs that only
//! exist in the scheduler's memory travel back inside that reply.

use std::collections::BTreeMap;

use arrow::compute::concat_batches;
use arrow::error::ArrowError;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::core::runner::SessionInfo;
use crate::domain::{Data, ImageData, Table};

use super::TaskFailure;

/// Client to scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Register a session; the scheduler builds its catalog from `session`
    Open { session: SessionInfo },

    /// Run `node` once every task in `deps` has finished
    Submit {
        session_id: Uuid,
        node: String,
        deps: Vec<String>,
        #[serde(default)]
        is_async: bool,
    },

    /// Forget a session; submitted work keeps running
    Close { session_id: Uuid },
}

/// Scheduler to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Opened {
        session_id: Uuid,
    },
    Finished {
        session_id: Uuid,
        node: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<TaskFailure>,
        /// Values of the node's outputs held only in scheduler memory
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        outputs: BTreeMap<String, Payload>,
    },
    Rejected {
        message: String,
    },
}

/// A node output on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// Arrow IPC stream
    Table { ipc: Vec<u8> },
    Object { value: Value },
    Image { width: u32, height: u32, pixels: Vec<u8> },
}

impl Payload {
    pub fn encode(data: &Data) -> Result<Self, ArrowError> {
        Ok(match data {
            Data::Table(table) => {
                let mut writer = StreamWriter::try_new(Vec::new(), &table.schema())?;
                writer.write(table.batch())?;
                Payload::Table {
                    ipc: writer.into_inner()?,
                }
            }
            Data::Object(value) => Payload::Object { value: value.clone() },
            Data::Image(image) => Payload::Image {
                width: image.width,
                height: image.height,
                pixels: image.pixels.clone(),
            },
        })
    }

    pub fn decode(self) -> Result<Data, ArrowError> {
        Ok(match self {
            Payload::Table { ipc } => {
                let reader = StreamReader::try_new(ipc.as_slice(), None)?;
                let schema = reader.schema();
                let batches = reader.collect::<Result<Vec<_>, _>>()?;
                Data::Table(Table::new(concat_batches(&schema, &batches)?))
            }
            Payload::Object { value } => Data::Object(value),
            Payload::Image { width, height, pixels } => {
                if pixels.len() != width as usize * height as usize * 3 {
                    return Err(ArrowError::InvalidArgumentError(format!(
                        "{} pixel bytes do not fill a {}x{} image",
                        pixels.len(),
                        width,
                        height
                    )));
                }
                Data::Image(ImageData { width, height, pixels })
            }
        })
    }
}

/// Write one message followed by a newline
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Read the next message; `None` once the peer has hung up
pub async fn read_message<R, T>(reader: &mut R) -> std::io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            break;
        }
    }
    let message = serde_json::from_str(line.trim_end())?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use arrow::array::{ArrayRef, Int64Array, StringArray};
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_messages_share_one_stream() {
        let session_id = Uuid::new_v4();
        let mut buf = Vec::new();
        write_message(
            &mut buf,
            &Request::Submit {
                session_id,
                node: "merge_data_node".to_string(),
                deps: vec!["load_glacier_node".to_string()],
                is_async: false,
            },
        )
        .await
        .unwrap();
        write_message(&mut buf, &Request::Close { session_id }).await.unwrap();

        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with(r#"{"type":"submit""#));

        let mut reader = BufReader::new(buf.as_slice());
        let first: Option<Request> = read_message(&mut reader).await.unwrap();
        let second: Option<Request> = read_message(&mut reader).await.unwrap();
        let third: Option<Request> = read_message(&mut reader).await.unwrap();

        assert!(matches!(first, Some(Request::Submit { ref deps, .. }) if deps.len() == 1));
        assert_eq!(second, Some(Request::Close { session_id }));
        assert_eq!(third, None);
    }

    #[test]
    fn test_finished_without_failure_omits_fields() {
        let reply = Reply::Finished {
            session_id: Uuid::nil(),
            node: "a".to_string(),
            failure: None,
            outputs: BTreeMap::new(),
        };
        let json = serde_json::to_string(&reply).unwrap();
        assert!(!json.contains("failure"));
        assert!(!json.contains("outputs"));
    }

    #[tokio::test]
    async fn test_table_output_survives_the_wire() {
        let table = Table::from_columns([
            ("WGMS_ID", Arc::new(Int64Array::from(vec![Some(1), None])) as ArrayRef),
            ("NAME", Arc::new(StringArray::from(vec!["ALETSCH", "RHONE"])) as ArrayRef),
        ])
        .unwrap();
        let reply = Reply::Finished {
            session_id: Uuid::nil(),
            node: "count_node".to_string(),
            failure: None,
            outputs: BTreeMap::from([("counts".to_string(), Payload::encode(&Data::Table(table.clone())).unwrap())]),
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &reply).await.unwrap();
        let read: Option<Reply> = read_message(&mut BufReader::new(buf.as_slice())).await.unwrap();

        let Some(Reply::Finished { mut outputs, .. }) = read else {
            panic!("expected a finished reply");
        };
        let decoded = outputs.remove("counts").unwrap().decode().unwrap();
        assert_eq!(decoded, Data::Table(table));
    }

    #[test]
    fn test_short_image_payload_rejected() {
        let payload = Payload::Image {
            width: 2,
            height: 2,
            pixels: vec![0; 5],
        };
        assert!(payload.decode().is_err());
    }
}
