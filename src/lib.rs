pub mod cache;
pub mod config;
pub mod domains;
pub mod extract;
pub mod issues;
pub mod lexicon;
pub mod mail;
pub mod page;
pub mod prompt;
pub mod quota;
pub mod report;
pub mod scan;
pub mod visit;

pub use cache::VisitedCache;
pub use config::{CliOverrides, Config, Settings};
pub use extract::{CandidateLink, ExtractionResult, LinkExtractor, LinkSource};
pub use issues::{IssueLog, IssueRecord, Stage, StageCapture, Transcript};
pub use lexicon::Lexicon;
pub use mail::{GmailClient, MailMessage, MailProvider};
pub use prompt::{Confirmer, ForceConfirmer, StdinConfirmer};
pub use quota::{QuotaLedger, QuotaState, QuotaWindow};
pub use scan::{
    DomainScorer, HybridAnalysisScorer, LinkScanner, ScoredLink, VirusTotalScorer,
    SCAN_FAILED_SCORE,
};
pub use visit::{LinkVisitor, VisitOptions, VisitOutcome, VisitReport};
