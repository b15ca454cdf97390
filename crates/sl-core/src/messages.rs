use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::envelope::{MessageKind, Payload};

/// A concrete message type that can ride inside an [`Envelope`](crate::Envelope).
///
/// `TYPE_NAME` is the wire tag (`messageType`) and the registry key.
pub trait Message: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
    const KIND: MessageKind;

    fn into_payload(self) -> Payload;

    /// Borrow the concrete message back out of a payload of the same type.
    fn from_payload(payload: &Payload) -> Option<&Self>;
}

/// Declares one closed set of messages: the sum type, its `Message` impls and
/// the `From<T> for Payload` conversions.
macro_rules! message_set {
    ($set:ident, $kind:expr, $payload:ident, $register:ident { $($variant:ident),+ $(,)? }) => {
        #[derive(Debug, Clone, PartialEq)]
        pub enum $set {
            $($variant($variant)),+
        }

        impl $set {
            /// Wire tag of the concrete message.
            pub fn type_name(&self) -> &'static str {
                match self {
                    $(Self::$variant(_) => <$variant as Message>::TYPE_NAME),+
                }
            }

            pub(crate) fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
                match self {
                    $(Self::$variant(m) => serde_json::to_value(m)),+
                }
            }
        }

        $(
            impl Message for $variant {
                const TYPE_NAME: &'static str = stringify!($variant);
                const KIND: MessageKind = $kind;

                fn into_payload(self) -> Payload {
                    Payload::$payload($set::$variant(self))
                }

                fn from_payload(payload: &Payload) -> Option<&Self> {
                    match payload {
                        Payload::$payload($set::$variant(m)) => Some(m),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }
            }

            impl From<$variant> for $set {
                fn from(m: $variant) -> Self {
                    $set::$variant(m)
                }
            }

            impl From<$variant> for Payload {
                fn from(m: $variant) -> Self {
                    m.into_payload()
                }
            }
        )+

        /// Registers every message of this set; used by the builtin registry.
        pub(crate) fn $register(registry: &mut crate::registry::MessageRegistry) {
            $(registry.register::<$variant>();)+
        }
    };
}

// ---------------------------------------------------------------------------
// Commands (hub -> node)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KickPlayer {
    pub player_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanPlayer {
    pub player_id: String,
    #[serde(default)]
    pub reason: Option<String>,
    /// `None` = permanent.
    #[serde(default)]
    pub duration_minutes: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnbanPlayer {
    pub player_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhitelistPlayer {
    pub player_id: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announce {
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConsoleCommand {
    pub command: String,
}

message_set!(Command, MessageKind::Command, Command, register_commands {
    KickPlayer,
    BanPlayer,
    UnbanPlayer,
    WhitelistPlayer,
    Announce,
    RunConsoleCommand,
});

// ---------------------------------------------------------------------------
// Events (node -> hub -> observers)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerJoined {
    pub player_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerLeft {
    pub player_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub player_id: String,
    pub channel: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHeartbeat {
    pub players_online: u32,
    pub tick_rate: f32,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStarted {
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStopping {
    #[serde(default)]
    pub reason: Option<String>,
}

message_set!(Event, MessageKind::Event, Event, register_events {
    PlayerJoined,
    PlayerLeft,
    ChatMessage,
    ServerHeartbeat,
    ServerStarted,
    ServerStopping,
});

pub(crate) fn register_builtin(registry: &mut crate::registry::MessageRegistry) {
    register_commands(registry);
    register_events(registry);
}
