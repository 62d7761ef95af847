//! Message definitions for the coordination protocol.
//!
//! Tensor payloads travel as safetensors blobs inside the messages; the
//! codec never looks inside them.

/// Protocol version; bumped on any wire-incompatible change.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Hello = 1,
    TrainBatch = 2,
    RequestModel = 3,
    ModelUpdate = 4,
    InferRequest = 5,
    InferResponse = 6,
    Barrier = 7,
    BarrierRelease = 8,
    Shard = 9,
    SampleRequest = 10,
    SampleReply = 11,
}

/// First message on every connection; identifies the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub rank: u32,
    /// False for frozen opponents that never ask for new weights.
    pub wants_model_updates: bool,
    /// Tournament opponents receive weights once at attach time, then never
    /// again.
    pub tournament_opponent: bool,
}

/// Finished trajectory slots pushed up to the serving side's replay buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainBatch {
    pub blob: Vec<u8>,
}

/// Fresh weights snapshot pushed to an attached peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelUpdate {
    pub tag: String,
    pub blob: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferRequest {
    pub request_id: u64,
    pub blob: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferResponse {
    pub request_id: u64,
    pub blob: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Barrier {
    pub rank: u32,
}

/// One rank's share of a scattered training batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub step: u64,
    pub blob: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRequest {
    pub batchsize: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleReply {
    pub blob: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(Hello),
    TrainBatch(TrainBatch),
    RequestModel,
    ModelUpdate(ModelUpdate),
    InferRequest(InferRequest),
    InferResponse(InferResponse),
    Barrier(Barrier),
    BarrierRelease,
    Shard(Shard),
    SampleRequest(SampleRequest),
    SampleReply(SampleReply),
}

impl Message {
    pub fn kind(&self) -> MsgKind {
        match self {
            Message::Hello(_) => MsgKind::Hello,
            Message::TrainBatch(_) => MsgKind::TrainBatch,
            Message::RequestModel => MsgKind::RequestModel,
            Message::ModelUpdate(_) => MsgKind::ModelUpdate,
            Message::InferRequest(_) => MsgKind::InferRequest,
            Message::InferResponse(_) => MsgKind::InferResponse,
            Message::Barrier(_) => MsgKind::Barrier,
            Message::BarrierRelease => MsgKind::BarrierRelease,
            Message::Shard(_) => MsgKind::Shard,
            Message::SampleRequest(_) => MsgKind::SampleRequest,
            Message::SampleReply(_) => MsgKind::SampleReply,
        }
    }
}
