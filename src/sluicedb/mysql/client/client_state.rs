use strum::Display;

#[derive(Display, Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientState {
    /// Proxy header, SSLRequest and the handshake response
    Handshaking,
    Authenticating,
    /// COM_CHANGE_USER is being authenticated, the session carries on afterwards either way
    ChangingUser,
    Ready,
    /// The client sent COM_QUIT
    Quit,
    Failed,
}

impl ClientState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ClientState::Quit | ClientState::Failed)
    }

    pub fn is_authenticating(&self) -> bool {
        matches!(self, ClientState::Authenticating | ClientState::ChangingUser)
    }
}

#[derive(Display, Debug, Copy, Clone, Eq, PartialEq)]
pub enum AuthState {
    FindEntry,
    /// A host pattern needs the client's host name, waiting for the reverse lookup
    FindEntryRdns,
    StartExchange,
    /// Sent an AuthSwitchRequest, waiting for the client's token
    ContinueExchange,
    CheckToken,
    StartSession,
    /// Waiting for a user account reload before looking up the user once more
    TryAgain,
    Complete,
    Fail,
}

impl AuthState {
    /// Suspended until something other than client data resumes it
    pub fn is_parked(&self) -> bool {
        matches!(self, AuthState::FindEntryRdns | AuthState::TryAgain)
    }
}

#[derive(Display, Debug, Copy, Clone, Eq, PartialEq)]
pub enum RoutingState {
    /// The next client packet starts a command
    PacketStart,
    /// The next client packet continues a payload of 16MB or more
    LargePacket,
    /// The client is sending LOAD DATA LOCAL INFILE contents
    LoadData,
    /// Waiting for the reply that decides whether USE, SET ROLE or COM_INIT_DB took effect
    ChangingState,
    /// A KILL is running on the servers
    Killing,
}

impl RoutingState {
    /// Client commands wait in the deferred queue
    pub fn defers_commands(&self) -> bool {
        matches!(self, RoutingState::ChangingState | RoutingState::Killing)
    }
}
