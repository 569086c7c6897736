//! Gabriel protocol messages.
//!
//! Hand-maintained prost definitions mirroring the Gabriel protobuf schema,
//! so frames produced by any Gabriel client decode here unchanged:
//!
//! - `FromClient` wraps one `InputFrame` sent by a client.
//! - `ToClient` is either the `Welcome` sent once per connection or a
//!   `Response` carrying the engine's `ResultWrapper` for one frame.

/// Declared type of a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PayloadType {
    Image = 0,
    Video = 1,
    Audio = 2,
    Accelerometer = 3,
    Gps = 4,
    Text = 5,
    Animation = 6,
    Other = 7,
}

/// One unit of input sent to an engine.
#[derive(Clone, PartialEq, prost::Message)]
pub struct InputFrame {
    #[prost(enumeration = "PayloadType", tag = "1")]
    pub payload_type: i32,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub payloads: Vec<Vec<u8>>,
}

impl InputFrame {
    /// Build a frame with the given type and payloads.
    pub fn new(payload_type: PayloadType, payloads: Vec<Vec<u8>>) -> Self {
        Self {
            payload_type: payload_type as i32,
            payloads,
        }
    }
}

/// Response envelope returned by an engine for one frame.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ResultWrapper {
    #[prost(enumeration = "result_wrapper::Status", tag = "1")]
    pub status: i32,
    #[prost(message, repeated, tag = "2")]
    pub results: Vec<result_wrapper::Result>,
}

pub mod result_wrapper {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Result {
        #[prost(enumeration = "super::PayloadType", tag = "1")]
        pub payload_type: i32,
        #[prost(bytes = "vec", tag = "2")]
        pub payload: Vec<u8>,
    }

    impl Result {
        pub fn new(payload_type: super::PayloadType, payload: Vec<u8>) -> Self {
            Self {
                payload_type: payload_type as i32,
                payload,
            }
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum Status {
        Success = 0,
        UnspecifiedError = 1,
        WrongInputFormat = 2,
        EngineError = 3,
        NoTokens = 4,
        ServerDroppedFrame = 5,
    }
}

/// Create a result wrapper with the given status and no results.
pub fn create_result_wrapper(status: result_wrapper::Status) -> ResultWrapper {
    ResultWrapper {
        status: status as i32,
        results: Vec::new(),
    }
}

/// Client to server envelope.
#[derive(Clone, PartialEq, prost::Message)]
pub struct FromClient {
    #[prost(int64, tag = "1")]
    pub frame_id: i64,
    #[prost(string, tag = "2")]
    pub source_name: String,
    #[prost(message, optional, tag = "3")]
    pub input_frame: Option<InputFrame>,
}

/// Server to client envelope.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ToClient {
    #[prost(oneof = "to_client::WelcomeOrResponse", tags = "1, 2")]
    pub welcome_or_response: Option<to_client::WelcomeOrResponse>,
}

pub mod to_client {
    /// Sent once when a connection is accepted.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Welcome {
        #[prost(string, repeated, tag = "1")]
        pub sources_consumed: Vec<String>,
        #[prost(int32, tag = "2")]
        pub num_tokens_per_source: i32,
    }

    /// Answer to one `FromClient` frame.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Response {
        #[prost(string, tag = "1")]
        pub source_name: String,
        #[prost(int64, tag = "2")]
        pub frame_id: i64,
        #[prost(bool, tag = "3")]
        pub return_token: bool,
        #[prost(message, optional, tag = "4")]
        pub result_wrapper: Option<super::ResultWrapper>,
    }

    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum WelcomeOrResponse {
        #[prost(message, tag = "1")]
        Welcome(Welcome),
        #[prost(message, tag = "2")]
        Response(Response),
    }
}

impl ToClient {
    pub fn welcome(sources_consumed: Vec<String>, num_tokens_per_source: i32) -> Self {
        Self {
            welcome_or_response: Some(to_client::WelcomeOrResponse::Welcome(
                to_client::Welcome {
                    sources_consumed,
                    num_tokens_per_source,
                },
            )),
        }
    }

    pub fn response(
        source_name: &str,
        frame_id: i64,
        return_token: bool,
        result_wrapper: ResultWrapper,
    ) -> Self {
        Self {
            welcome_or_response: Some(to_client::WelcomeOrResponse::Response(
                to_client::Response {
                    source_name: source_name.to_string(),
                    frame_id,
                    return_token,
                    result_wrapper: Some(result_wrapper),
                },
            )),
        }
    }
}
