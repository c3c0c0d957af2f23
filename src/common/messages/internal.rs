use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KrpcMessage {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: [u8; 20],

    /// Id of the sender.
    #[serde(with = "serde_bytes")]
    pub id: [u8; 20],

    /// Compact address of the sender.
    #[serde(with = "serde_bytes")]
    pub ip: [u8; 6],

    #[serde(flatten)]
    pub variant: KrpcVariant,
}

impl KrpcMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<KrpcMessage, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "y")]
pub enum KrpcVariant {
    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "pong")]
    Pong,

    #[serde(rename = "find_node")]
    FindNode {
        #[serde(rename = "a")]
        arguments: FindNodeArguments,
    },

    #[serde(rename = "return_node")]
    ReturnNode {
        #[serde(rename = "r")]
        arguments: ReturnNodeArguments,
    },

    #[serde(rename = "find_value")]
    FindValue {
        #[serde(rename = "a")]
        arguments: FindValueArguments,
    },

    #[serde(rename = "return_value")]
    ReturnValue {
        #[serde(rename = "r")]
        arguments: ReturnValueArguments,
    },

    #[serde(rename = "store")]
    Store {
        #[serde(rename = "a")]
        arguments: StoreArguments,
    },
}

// === FIND NODE ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FindNodeArguments {
    #[serde(with = "serde_bytes")]
    pub target: [u8; 20],
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReturnNodeArguments {
    #[serde(with = "serde_bytes")]
    pub nodes: Box<[u8]>,
}

// === FIND VALUE ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FindValueArguments {
    #[serde(with = "serde_bytes")]
    pub key: Box<[u8]>,

    #[serde(with = "serde_bytes")]
    pub target: [u8; 20],
}

/// Exactly one of `v` and `nodes` is present.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReturnValueArguments {
    #[serde(with = "serde_bytes")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<Box<[u8]>>,

    #[serde(with = "serde_bytes")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Box<[u8]>>,
}

// === STORE ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoreArguments {
    #[serde(with = "serde_bytes")]
    pub key: Box<[u8]>,

    #[serde(with = "serde_bytes")]
    pub target: [u8; 20],

    #[serde(with = "serde_bytes")]
    pub v: Box<[u8]>,
}
