pub mod invite;

pub use invite::{parse_invite, Invite, InviteError, InviteMethod};
