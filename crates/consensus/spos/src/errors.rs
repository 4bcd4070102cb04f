//! SPoS Consensus Errors

/// SPoS-specific error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SposError {
    /// Round clock built without a time source
    #[error("nil sync timer")]
    NilSyncTimer,

    /// Round duration is zero or negative
    #[error("invalid round duration")]
    InvalidRoundDuration,

    #[error("nil hasher")]
    NilHasher,

    #[error("nil marshalizer")]
    NilMarshalizer,

    #[error("nil shard coordinator")]
    NilShardCoordinator,

    #[error("nil nodes coordinator")]
    NilNodesCoordinator,

    #[error("nil chain parameters handler")]
    NilChainParametersHandler,

    #[error("nil headers data pool")]
    NilHeadersDataPool,

    #[error("nil storage")]
    NilStorage,

    #[error("nil messenger")]
    NilMessenger,

    #[error("nil keys handler")]
    NilKeysHandler,

    #[error("nil alarm scheduler")]
    NilAlarmScheduler,

    #[error("nil interceptors container")]
    NilInterceptorsContainer,

    #[error("nil headers subscriber")]
    NilHeadersSubscriber,

    #[error("nil block processor")]
    NilBlockProcessor,

    #[error("nil blockchain")]
    NilBlockchain,

    #[error("nil signing handler")]
    NilSigningHandler,

    #[error("nil peer signature handler")]
    NilPeerSignatureHandler,

    #[error("nil broadcast messenger")]
    NilBroadcastMessenger,

    #[error("nil round handler")]
    NilRoundHandler,

    #[error("nil header validator")]
    NilHeaderValidator,

    #[error("nil fallback header validator")]
    NilFallbackHeaderValidator,

    #[error("nil consensus state")]
    NilConsensusState,

    #[error("nil message validator")]
    NilMessageValidator,

    #[error("nil channel")]
    NilChannel,

    /// A delayed broadcast cache was configured with zero capacity
    #[error("invalid cache size")]
    InvalidCacheSize,

    /// Consensus type string not recognised
    #[error("invalid consensus type: {0}")]
    InvalidConsensusType(String),

    /// Configuration could not be parsed
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    // Header construction checks
    #[error("nil block header")]
    NilBlockHeader,

    #[error("lower round in block")]
    LowerRoundInBlock,

    #[error("wrong nonce in block")]
    WrongNonceInBlock,

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("block hash does not match")]
    BlockHashDoesNotMatch,

    #[error("random seed does not match")]
    RandSeedDoesNotMatch,

    /// Proposal epoch differs from the one derived from the chain tip
    #[error("wrong epoch in block: expected {expected}, got {got}")]
    WrongEpochInBlock { expected: u32, got: u32 },

    // Consensus group computation
    #[error("nil header handler")]
    NilHeaderHandler,

    #[error("nil previous random seed")]
    NilPrevRandSeed,

    #[error("nil randomness")]
    NilRandomness,

    #[error("invalid shard id: {0}")]
    InvalidShardId(u32),

    #[error("epoch nodes config does not exist for epoch {0}")]
    EpochNodesConfigDoesNotExist(u32),

    #[error("validator not found")]
    ValidatorNotFound,

    /// Selector asked for more validators than the shard has
    #[error("invalid sample size: requested {requested}, available {available}")]
    InvalidSampleSize {
        /// Requested consensus group size
        requested: usize,
        /// Distinct validators in the list
        available: usize,
    },

    #[error("nil header")]
    NilHeader,

    #[error("nil header hash")]
    NilHeaderHash,

    #[error("nil header proof")]
    NilHeaderProof,

    #[error("nil body")]
    NilBody,

    #[error("nil parameter")]
    NilParameter,

    #[error("header not found")]
    MissingHeader,

    #[error("key not found in storage unit {0}")]
    KeyNotFound(String),

    #[error("invalid metachain header")]
    InvalidMetaHeader,

    // Consensus message validation
    #[error("invalid chain id")]
    InvalidChainId,

    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("invalid message from public key {0}")]
    InvalidMessage(String),

    #[error("invalid header hash size: {0}")]
    InvalidHeaderHashSize(usize),

    #[error("invalid public key size: {0}")]
    InvalidPublicKeySize(usize),

    #[error("invalid signature size: {0}")]
    InvalidSignatureSize(usize),

    #[error("invalid public key bitmap size: {0}")]
    InvalidPublicKeyBitmapSize(usize),

    #[error("invalid body size: {0}")]
    InvalidBodySize(usize),

    #[error("invalid header size: {0}")]
    InvalidHeaderSize(usize),

    #[error("node is not in eligible list")]
    NodeIsNotInEligibleList,

    /// Leader-only message sent by another member
    #[error("message from {0} requires the round leader")]
    NotLeader(String),

    #[error("message for future round {0}")]
    MessageForFutureRound(i64),

    #[error("message for past round {0}")]
    MessageForPastRound(i64),

    #[error("message type limit reached for public key {0}")]
    MessageTypeLimitReached(String),

    #[error("originator mismatch")]
    OriginatorMismatch,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid private key")]
    InvalidPrivateKey,

    #[error("invalid index: {0}")]
    InvalidIndex(usize),

    #[error("nil signature share for index {0}")]
    NilSignatureShare(usize),

    #[error("nil bitmap")]
    NilBitmap,

    #[error("not enough signatures: have {have}, need {need}")]
    InsufficientSignatures { have: usize, need: usize },

    #[error("node is not in consensus group")]
    NotInConsensusGroup,

    #[error("round canceled")]
    RoundCanceled,

    #[error("round {0} is before genesis")]
    RoundBeforeGenesis(i64),

    /// The running round dropped its inbox
    #[error("consensus channel closed")]
    ChannelClosed,

    #[error("time is out")]
    TimeIsOut,

    #[error("block processing failed: {0}")]
    BlockProcessing(String),

    /// Marshal or unmarshal failure
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid proof")]
    InvalidProof,

    #[error("alarm scheduler requires a running tokio runtime")]
    NoRuntime,

    #[error("topic not found: {0}")]
    TopicNotFound(String),

    /// Custom error message
    #[error("{0}")]
    Custom(String),
}

impl From<serde_json::Error> for SposError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<alloy_rlp::Error> for SposError {
    fn from(err: alloy_rlp::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Result type for SPoS operations
pub type SposResult<T> = Result<T, SposError>;
