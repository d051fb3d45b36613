// Channel policies: which transports a channel accepts, in what failover
// order, and what mix of live legs keeps it healthy.

use serde::{Deserialize, Serialize};

/// One of the three interchangeable transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Socket,
    Sse,
    Polling,
}

/// The set of transport legs currently live on a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportSet {
    pub sockets: bool,
    pub streams: bool,
    pub polling: bool,
}

impl TransportSet {
    pub fn is_empty(self) -> bool {
        !self.sockets && !self.streams && !self.polling
    }
}

/// Declarative constraint on which transports a channel accepts.
///
/// | Policy | Sockets | SSE | Polling |
/// |---|---|---|---|
/// | `Binary` | required | – | – |
/// | `HighSecurity` | – | required | – |
/// | `Disconnected` | – | – | required |
/// | `ImmediateS2C` | preferred | fallback | – |
/// | `TwoWayMessages` | preferred | – | fallback |
/// | `NoSockets` | – | preferred | fallback |
/// | `SureDelivery` | preferred | fallback | fallback |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPolicy {
    Binary,
    HighSecurity,
    Disconnected,
    #[serde(rename = "immediate_s2c")]
    ImmediateS2C,
    TwoWayMessages,
    NoSockets,
    SureDelivery,
}

impl ChannelPolicy {
    /// Attach-time guard: may a connection of this kind join the channel?
    pub fn accepts(self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Socket => matches!(
                self,
                ChannelPolicy::Binary
                    | ChannelPolicy::ImmediateS2C
                    | ChannelPolicy::TwoWayMessages
                    | ChannelPolicy::SureDelivery
            ),
            TransportKind::Sse => matches!(
                self,
                ChannelPolicy::HighSecurity
                    | ChannelPolicy::ImmediateS2C
                    | ChannelPolicy::NoSockets
                    | ChannelPolicy::SureDelivery
            ),
            TransportKind::Polling => matches!(
                self,
                ChannelPolicy::Disconnected
                    | ChannelPolicy::TwoWayMessages
                    | ChannelPolicy::NoSockets
                    | ChannelPolicy::SureDelivery
            ),
        }
    }

    /// Client-side attempt order.
    pub fn failover(self) -> &'static [TransportKind] {
        match self {
            ChannelPolicy::Binary => &[TransportKind::Socket],
            ChannelPolicy::HighSecurity => &[TransportKind::Sse],
            ChannelPolicy::Disconnected => &[TransportKind::Polling],
            ChannelPolicy::ImmediateS2C => &[TransportKind::Socket, TransportKind::Sse],
            ChannelPolicy::TwoWayMessages => &[TransportKind::Socket, TransportKind::Polling],
            ChannelPolicy::NoSockets => &[TransportKind::Sse, TransportKind::Polling],
            ChannelPolicy::SureDelivery => &[
                TransportKind::Socket,
                TransportKind::Sse,
                TransportKind::Polling,
            ],
        }
    }

    /// Health predicate: do the live legs satisfy the policy's required set?
    pub fn satisfied_by(self, live: TransportSet) -> bool {
        match self {
            ChannelPolicy::Binary => live.sockets,
            ChannelPolicy::HighSecurity => live.streams,
            ChannelPolicy::Disconnected => !live.sockets && !live.streams,
            ChannelPolicy::ImmediateS2C => live.sockets || live.streams,
            ChannelPolicy::TwoWayMessages => live.sockets || live.polling,
            ChannelPolicy::NoSockets => live.streams || live.polling,
            ChannelPolicy::SureDelivery => live.sockets || live.streams || live.polling,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelPolicy::Binary => "binary",
            ChannelPolicy::HighSecurity => "high_security",
            ChannelPolicy::Disconnected => "disconnected",
            ChannelPolicy::ImmediateS2C => "immediate_s2c",
            ChannelPolicy::TwoWayMessages => "two_way_messages",
            ChannelPolicy::NoSockets => "no_sockets",
            ChannelPolicy::SureDelivery => "sure_delivery",
        }
    }
}

impl std::fmt::Display for ChannelPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
