//! Remote simulators behind a framed channel.
//!
//! Frames are JSON messages with a 4-byte big-endian length prefix,
//! carried over any [`Transport`] — a TCP stream to a child process or
//! an already-running service, or an in-memory duplex in tests. One
//! reader task per connection correlates replies to in-flight requests
//! and serves the simulator's own requests back into the orchestrator.

use crate::call::{ApiCall, ApiReply};
use crate::link::{LinkHandle, dispatch_request};
use crate::proxy::Connection;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tandem_types::{
    EntityDesc, Frame, InputData, NonSerializableInputs, OutputReply, RawMeta, SimId, SimValue,
    SimulationError,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Anything a framed channel can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

type Writer = Arc<tokio::sync::Mutex<FramedWrite<WriteHalf<Box<dyn Transport>>, LengthDelimitedCodec>>>;

/// In-flight requests and the shared outgoing message counter.
struct PendingMap {
    next_id: u64,
    in_flight: HashMap<u64, oneshot::Sender<Result<Value, String>>>,
    /// Set once the channel is unusable; new requests fail immediately.
    closed: Option<String>,
}

/// [`Connection`] to a simulator on the far side of a framed channel.
pub struct RemoteConnection {
    sid: SimId,
    writer: Writer,
    pending: Arc<Mutex<PendingMap>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteConnection {
    /// Run the channel over an established transport.
    pub fn new(sid: SimId, transport: Box<dyn Transport>, link: LinkHandle) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        let writer: Writer = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
            write_half,
            LengthDelimitedCodec::new(),
        )));
        let pending = Arc::new(Mutex::new(PendingMap {
            next_id: 0,
            in_flight: HashMap::new(),
            closed: None,
        }));
        let reader = tokio::spawn(reader_loop(
            sid.clone(),
            FramedRead::new(read_half, LengthDelimitedCodec::new()),
            Arc::clone(&writer),
            Arc::clone(&pending),
            link,
        ));
        Self {
            sid,
            writer,
            pending,
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Dial an already-running simulator service.
    pub async fn connect(
        sid: SimId,
        addr: &str,
        link: LinkHandle,
    ) -> Result<Self, std::io::Error> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(sid, Box::new(stream), link))
    }

    /// Accept the connection a freshly started simulator process makes
    /// back to the orchestrator.
    pub async fn accept(
        sid: SimId,
        listener: &TcpListener,
        link: LinkHandle,
    ) -> Result<Self, std::io::Error> {
        let (stream, peer) = listener.accept().await?;
        tracing::debug!(sid = %sid, peer = %peer, "simulator connected");
        Ok(Self::new(sid, Box::new(stream), link))
    }

    fn lost(&self, reason: impl Into<String>) -> SimulationError {
        SimulationError::ConnectionLost {
            sid: self.sid.clone(),
            reason: reason.into(),
        }
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), SimulationError> {
        let bytes = serde_json::to_vec(&frame.to_value())
            .map_err(|e| self.lost(format!("encoding failed: {e}")))?;
        let mut writer = self.writer.lock().await;
        writer
            .send(Bytes::from(bytes))
            .await
            .map_err(|e| self.lost(e.to_string()))
    }

    fn encode(&self, call: &ApiCall) -> Result<(Vec<Value>, Map<String, Value>), SimulationError> {
        Ok(match call {
            ApiCall::Init {
                sid,
                time_resolution,
                params,
            } => {
                let mut kwargs = params.clone();
                if let Some(res) = time_resolution {
                    kwargs.insert("time_resolution".into(), json!(res));
                }
                (vec![json!(sid)], kwargs)
            }
            ApiCall::Create { num, model, params } => {
                (vec![json!(num), json!(model)], params.clone())
            }
            ApiCall::SetupDone => (vec![], Map::new()),
            ApiCall::Step {
                time,
                inputs,
                max_advance,
            } => {
                let inputs = self.encode_inputs(inputs)?;
                let mut args = vec![json!(time), inputs];
                if let Some(ma) = max_advance {
                    args.push(json!(ma));
                }
                (args, Map::new())
            }
            ApiCall::GetData { outputs } => {
                let outputs = serde_json::to_value(outputs)
                    .map_err(|e| self.lost(format!("encoding failed: {e}")))?;
                (vec![outputs], Map::new())
            }
            ApiCall::Extra { args, kwargs, .. } => (args.clone(), kwargs.clone()),
        })
    }

    /// Encode step inputs, aggregating every opaque value into one
    /// error so the user sees all offending sources at once.
    fn encode_inputs(&self, inputs: &InputData) -> Result<Value, SimulationError> {
        let mut offenders = Vec::new();
        let mut encoded = Map::new();
        for (eid, attrs) in inputs {
            let mut attr_map = Map::new();
            for (attr, sources) in attrs {
                let mut source_map = Map::new();
                for (src, value) in sources {
                    match value {
                        SimValue::Json(v) => {
                            source_map.insert(src.clone(), v.clone());
                        }
                        SimValue::Opaque(_) => {
                            offenders.push((eid.clone(), attr.clone(), src.clone()));
                        }
                    }
                }
                attr_map.insert(attr.clone(), Value::Object(source_map));
            }
            encoded.insert(eid.to_string(), Value::Object(attr_map));
        }
        if offenders.is_empty() {
            Ok(Value::Object(encoded))
        } else {
            Err(NonSerializableInputs {
                dest: self.sid.clone(),
                errors: offenders,
            }
            .into())
        }
    }

    fn decode(&self, call: &ApiCall, value: Value) -> Result<ApiReply, SimulationError> {
        let malformed = |reason: String| SimulationError::MalformedReply {
            sid: self.sid.clone(),
            method: call.method().to_owned(),
            reason,
        };
        Ok(match call {
            ApiCall::Init { .. } => {
                let raw: RawMeta =
                    serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;
                ApiReply::Meta(raw)
            }
            ApiCall::Create { .. } => {
                let entities: Vec<EntityDesc> =
                    serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;
                ApiReply::Entities(entities)
            }
            ApiCall::SetupDone => ApiReply::Done,
            ApiCall::Step { .. } => match value {
                Value::Null => ApiReply::NextStep(None),
                Value::Number(n) => ApiReply::NextStep(Some(n.as_u64().ok_or_else(|| {
                    SimulationError::InvalidNextStep {
                        sid: self.sid.clone(),
                        reason: format!("next step must be a non-negative integer, got {n}"),
                    }
                })?)),
                other => {
                    return Err(SimulationError::InvalidNextStep {
                        sid: self.sid.clone(),
                        reason: format!("next step must be an integer or null, got {other}"),
                    });
                }
            },
            ApiCall::GetData { .. } => {
                let Value::Object(mut raw) = value else {
                    return Err(malformed("get_data reply is not an object".into()));
                };
                let time = match raw.remove("time") {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(v.as_u64().ok_or_else(|| {
                        malformed(format!("output time must be a non-negative integer, got {v}"))
                    })?),
                };
                let mut data = BTreeMap::new();
                for (eid, attrs) in raw {
                    let Value::Object(attrs) = attrs else {
                        return Err(malformed(format!("attributes of {eid} are not an object")));
                    };
                    data.insert(
                        eid.into(),
                        attrs
                            .into_iter()
                            .map(|(attr, v)| (attr, SimValue::Json(v)))
                            .collect(),
                    );
                }
                ApiReply::Data(OutputReply { time, data })
            }
            ApiCall::Extra { .. } => ApiReply::Value(value),
        })
    }
}

#[async_trait]
impl Connection for RemoteConnection {
    async fn request(&self, call: ApiCall) -> Result<ApiReply, SimulationError> {
        let (args, kwargs) = self.encode(&call)?;
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            if let Some(reason) = &pending.closed {
                return Err(self.lost(reason.clone()));
            }
            let id = pending.next_id;
            pending.next_id += 1;
            pending.in_flight.insert(id, tx);
            id
        };

        let frame = Frame::Request {
            id,
            method: call.method().to_owned(),
            args,
            kwargs,
        };
        if let Err(e) = self.send_frame(&frame).await {
            self.pending
                .lock()
                .expect("pending map poisoned")
                .in_flight
                .remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(value)) => self.decode(&call, value),
            Ok(Err(message)) => Err(SimulationError::Request {
                sid: self.sid.clone(),
                method: call.method().to_owned(),
                message,
            }),
            Err(_) => Err(self.lost("channel closed while waiting for a reply")),
        }
    }

    async fn stop(&self) {
        // Best-effort terminator; the simulator may already be gone.
        let id = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            let id = pending.next_id;
            pending.next_id += 1;
            id
        };
        let frame = Frame::Request {
            id,
            method: "stop".into(),
            args: vec![],
            kwargs: Map::new(),
        };
        if let Err(e) = self.send_frame(&frame).await {
            tracing::debug!(sid = %self.sid, error = %e, "stop message could not be sent");
        }
        if let Err(e) = self.writer.lock().await.close().await {
            tracing::debug!(sid = %self.sid, error = %e, "closing the channel failed");
        }
        let reader = self.reader.lock().expect("reader handle poisoned").take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }
    }
}

/// Reads frames until end-of-stream: replies complete in-flight
/// requests, requests are dispatched to the orchestrator link.
async fn reader_loop(
    sid: SimId,
    mut frames: FramedRead<ReadHalf<Box<dyn Transport>>, LengthDelimitedCodec>,
    writer: Writer,
    pending: Arc<Mutex<PendingMap>>,
    link: LinkHandle,
) {
    let reason = loop {
        let bytes = match frames.next().await {
            None => break "end of stream".to_owned(),
            Some(Err(e)) => {
                tracing::warn!(sid = %sid, error = %e, "transport error");
                break e.to_string();
            }
            Some(Ok(bytes)) => bytes,
        };
        let frame = serde_json::from_slice::<Value>(&bytes)
            .map_err(|e| e.to_string())
            .and_then(Frame::from_value);
        let frame = match frame {
            Ok(frame) => frame,
            Err(reason) => {
                tracing::warn!(sid = %sid, reason = %reason, "malformed frame");
                break format!("malformed frame: {reason}");
            }
        };
        match frame {
            Frame::Success { id, payload } => complete(&pending, id, Ok(payload)),
            Frame::Failure { id, message } => complete(&pending, id, Err(message)),
            Frame::Request {
                id,
                method,
                args,
                kwargs,
            } => {
                let reply = match dispatch_request(link.as_ref(), &method, args, kwargs).await {
                    Ok(payload) => Frame::Success { id, payload },
                    Err(message) => Frame::Failure { id, message },
                };
                let bytes = match serde_json::to_vec(&reply.to_value()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(sid = %sid, error = %e, "reply encoding failed");
                        continue;
                    }
                };
                if let Err(e) = writer.lock().await.send(Bytes::from(bytes)).await {
                    tracing::warn!(sid = %sid, error = %e, "reply could not be sent");
                    break e.to_string();
                }
            }
        }
    };

    // Fail whoever is still waiting; new requests fail at submission.
    let mut pending = pending.lock().expect("pending map poisoned");
    pending.closed = Some(reason.clone());
    for (_, tx) in pending.in_flight.drain() {
        let _ = tx.send(Err(reason.clone()));
    }
}

fn complete(pending: &Arc<Mutex<PendingMap>>, id: u64, result: Result<Value, String>) {
    let tx = pending
        .lock()
        .expect("pending map poisoned")
        .in_flight
        .remove(&id);
    match tx {
        Some(tx) => {
            let _ = tx.send(result);
        }
        None => tracing::warn!(id, "reply for an unknown request"),
    }
}
