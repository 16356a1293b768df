/// Topic-name prefix of a user's self channel (`usr<uid>`).
pub const PREFIX_SELF: &str = "usr";

/// Topic-name prefix of a user's discovery channel (`fnd<uid>`).
pub const PREFIX_FIND: &str = "fnd";

/// Topic-name prefix of a one-to-one topic (`p2p<uid><uid>`).
pub const PREFIX_P2P: &str = "p2p";

/// Topic-name prefix conventionally given to group topics.
pub const PREFIX_GROUP: &str = "grp";

/// Separator between topic and user in a subscription id.
pub const SUBSCRIPTION_ID_SEPARATOR: char = ':';

/// Message lifetime on one-to-one topics (1 year).
pub const EXPIRE_SECS_P2P: i64 = 31_536_000;

/// Message lifetime on group topics (1 week).
pub const EXPIRE_SECS_GROUP: i64 = 604_800;

/// Message lifetime on self channels (30 days).
pub const EXPIRE_SECS_SELF: i64 = 2_592_000;

/// Id of the built-in self-talk service account unless configured otherwise.
pub const DEFAULT_SELF_TALK_SERVICE_ID: u64 = 5;

/// Upper bound on tags and users considered by a single discovery query.
pub const MAX_DISCOVERY_RESULTS: usize = 100;

/// Upper bound on messages returned by a single history query.
pub const MAX_MESSAGES_RETRIEVED: usize = 100;
