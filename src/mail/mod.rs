pub mod fetcher;
pub mod mailbox;
pub mod parser;
pub mod radar;

pub use fetcher::{FetchError, FetchOutcome, FetchedMessage, MailSource, ScriptFetcher};
pub use parser::{EmailParser, ParseError, ParsedEmail};
pub use radar::{Radar, RadarError, RadarSweep};
