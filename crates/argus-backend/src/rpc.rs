//! AMQP RPC backend.
//!
//! Frames are encoded into a protobuf command and published to the worker
//! routing key with a per-request correlation id and a process-private,
//! auto-deleting response queue as reply-to. A single consumer task routes
//! responses by correlation id into a shared slot map; each PendingResult
//! polls its slot until the caller's deadline expires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use prost::Message;
use tokio::sync::Mutex;
use uuid::Uuid;

use argus_formats::native::PredictionRecord;

use crate::{Backend, BackendError, InferError, PendingReply, PendingResult};

/// Inner poll interval while waiting on a response slot. Small enough to
/// react quickly, large enough not to saturate a core.
pub const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Wire messages exchanged with the recognition workers.
pub mod proto {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct InferenceCommand {
        #[prost(int64, tag = "1")]
        pub recognition_version_id: i64,
        /// JPEG-encoded frame payload.
        #[prost(bytes = "vec", tag = "2")]
        pub image: ::prost::alloc::vec::Vec<u8>,
        #[prost(bool, tag = "3")]
        pub show_discarded: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BoundingBox {
        #[prost(float, tag = "1")]
        pub xmin: f32,
        #[prost(float, tag = "2")]
        pub ymin: f32,
        #[prost(float, tag = "3")]
        pub xmax: f32,
        #[prost(float, tag = "4")]
        pub ymax: f32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Region {
        #[prost(message, optional, tag = "1")]
        pub bbox: ::core::option::Option<BoundingBox>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct LabelPrediction {
        #[prost(int64, tag = "1")]
        pub label_id: i64,
        #[prost(string, tag = "2")]
        pub label_name: ::prost::alloc::string::String,
        #[prost(float, tag = "3")]
        pub score: f32,
        #[prost(float, tag = "4")]
        pub threshold: f32,
        #[prost(message, optional, tag = "5")]
        pub roi: ::core::option::Option<Region>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct LabelSet {
        #[prost(message, repeated, tag = "1")]
        pub predicted: ::prost::alloc::vec::Vec<LabelPrediction>,
        #[prost(message, repeated, tag = "2")]
        pub discarded: ::prost::alloc::vec::Vec<LabelPrediction>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct InferenceOutput {
        #[prost(message, optional, tag = "1")]
        pub labels: ::core::option::Option<LabelSet>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct InferenceResponse {
        #[prost(message, repeated, tag = "1")]
        pub outputs: ::prost::alloc::vec::Vec<InferenceOutput>,
        /// Non-empty when the worker failed to run the model.
        #[prost(string, tag = "2")]
        pub error: ::prost::alloc::string::String,
    }
}

fn annotation_from_proto(p: &proto::LabelPrediction) -> argus_formats::native::Annotation {
    argus_formats::native::Annotation {
        label_id: (p.label_id != 0).then_some(p.label_id),
        label_name: p.label_name.clone(),
        score: f64::from(p.score),
        threshold: (p.threshold != 0.0).then_some(f64::from(p.threshold)),
        roi: p.roi.as_ref().and_then(|r| r.bbox.as_ref()).map(|b| {
            argus_formats::native::Roi {
                bbox: argus_formats::native::BBox {
                    xmin: f64::from(b.xmin),
                    ymin: f64::from(b.ymin),
                    xmax: f64::from(b.xmax),
                    ymax: f64::from(b.ymax),
                },
            }
        }),
    }
}

/// Convert a worker response into the canonical record, or the uniform
/// failure when the worker reported an error.
fn record_from_response(response: &proto::InferenceResponse) -> Result<PredictionRecord, InferError> {
    if !response.error.is_empty() {
        return Err(InferError::Failed {
            code: "worker_error".into(),
            message: response.error.clone(),
        });
    }
    Ok(PredictionRecord {
        outputs: response
            .outputs
            .iter()
            .map(|o| argus_formats::native::Output {
                labels: o
                    .labels
                    .as_ref()
                    .map(|l| argus_formats::native::Labels {
                        predicted: l.predicted.iter().map(annotation_from_proto).collect(),
                        discarded: l.discarded.iter().map(annotation_from_proto).collect(),
                    })
                    .unwrap_or_default(),
            })
            .collect(),
    })
}

type SlotMap = Arc<Mutex<HashMap<String, Result<PredictionRecord, InferError>>>>;

#[derive(Debug)]
pub struct RpcBackend {
    connection: Connection,
    channel: Channel,
    routing_key: String,
    response_queue: String,
    recognition_id: i64,
    slots: SlotMap,
    consumer_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RpcBackend {
    pub async fn connect(
        amqp_url: &str,
        routing_key: &str,
        recognition_id: &str,
    ) -> Result<Self, BackendError> {
        let recognition_id: i64 = recognition_id.parse().map_err(|_| {
            BackendError::Config("cannot cast recognition ID into a number".into())
        })?;

        let connection = Connection::connect(amqp_url, ConnectionProperties::default())
            .await
            .map_err(|e| BackendError::Transport(format!("AMQP connect failed: {e}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BackendError::Transport(format!("AMQP channel failed: {e}")))?;

        let response_queue = format!("argus.responses.{}", Uuid::new_v4());
        channel
            .queue_declare(
                &response_queue,
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BackendError::Transport(format!("queue declare failed: {e}")))?;

        let mut consumer = channel
            .basic_consume(
                &response_queue,
                "argus-receiver",
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BackendError::Transport(format!("consume failed: {e}")))?;

        let slots: SlotMap = Arc::new(Mutex::new(HashMap::new()));
        let task_slots = slots.clone();
        let consumer_task = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("response stream closed: {e}");
                        break;
                    }
                };
                let Some(correlation_id) = delivery
                    .properties
                    .correlation_id()
                    .as_ref()
                    .map(|id| id.as_str().to_string())
                else {
                    tracing::warn!("response without correlation id, dropping");
                    continue;
                };
                let outcome = match proto::InferenceResponse::decode(&delivery.data[..]) {
                    Ok(response) => record_from_response(&response),
                    Err(e) => Err(InferError::Failed {
                        code: "bad_response".into(),
                        message: e.to_string(),
                    }),
                };
                task_slots.lock().await.insert(correlation_id, outcome);
            }
        });

        tracing::info!(%routing_key, response_queue, "RPC backend connected");
        Ok(Self {
            connection,
            channel,
            routing_key: routing_key.to_string(),
            response_queue,
            recognition_id,
            slots,
            consumer_task: Mutex::new(Some(consumer_task)),
        })
    }
}

#[async_trait]
impl Backend for RpcBackend {
    async fn infer(&self, image: Bytes, _frame_name: &str) -> Result<PendingResult, BackendError> {
        let command = proto::InferenceCommand {
            recognition_version_id: self.recognition_id,
            image: image.to_vec(),
            show_discarded: true,
        };
        let payload = command.encode_to_vec();
        let correlation_id = Uuid::new_v4().to_string();

        self.channel
            .basic_publish(
                "",
                &self.routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_correlation_id(correlation_id.clone().into())
                    .with_reply_to(self.response_queue.clone().into()),
            )
            .await
            .map_err(|e| BackendError::Transport(format!("publish failed: {e}")))?
            .await
            .map_err(|e| BackendError::Transport(format!("publish unconfirmed: {e}")))?;

        Ok(PendingResult::new(RpcPending {
            correlation_id,
            slots: self.slots.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BackendError> {
        if let Some(task) = self.consumer_task.lock().await.take() {
            task.abort();
        }
        // The exclusive response queue auto-deletes with the connection.
        self.channel
            .close(200, "closing")
            .await
            .map_err(|e| BackendError::Transport(format!("channel close failed: {e}")))?;
        self.connection
            .close(200, "closing")
            .await
            .map_err(|e| BackendError::Transport(format!("connection close failed: {e}")))?;
        Ok(())
    }
}

struct RpcPending {
    correlation_id: String,
    slots: SlotMap,
}

#[async_trait]
impl PendingReply for RpcPending {
    async fn wait(self: Box<Self>, timeout: Duration) -> Result<PredictionRecord, InferError> {
        let start = Instant::now();
        loop {
            if let Some(outcome) = self.slots.lock().await.remove(&self.correlation_id) {
                return outcome;
            }
            if start.elapsed() >= timeout {
                return Err(InferError::Timeout(timeout));
            }
            tokio::time::sleep(RESPONSE_POLL_INTERVAL).await;
        }
    }
}
