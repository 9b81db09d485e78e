pub mod parser;
pub mod reconcile;

use std::fmt;

use crate::errors::PicoError;
use crate::models::{ChunkMap, PicoConfig};

pub use parser::{AnalysisArgParser, ChunkArgParser, SkimArgParser};
pub use reconcile::{QueueCheck, Reconciler, Reconciliation};

/// Status of a chunk, derived from the batch queue and the output directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChunkStatus {
    Good,
    Pending,
    Bad,
    Missing,
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkStatus::Good => write!(f, "good"),
            ChunkStatus::Pending => write!(f, "pending"),
            ChunkStatus::Bad => write!(f, "bad"),
            ChunkStatus::Missing => write!(f, "missing"),
        }
    }
}

/// Output convention of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// NanoAOD skims: one output file per input file, named after the input.
    Skim,
    /// Analysis trees: one numbered output file per chunk.
    Analysis,
}

impl ChannelKind {
    pub fn of(channel: &str) -> Self {
        if PicoConfig::is_skim(channel) {
            ChannelKind::Skim
        } else {
            ChannelKind::Analysis
        }
    }

    pub fn parser(self) -> Result<Box<dyn ChunkArgParser>, PicoError> {
        Ok(match self {
            ChannelKind::Skim => Box::new(SkimArgParser::new()?),
            ChannelKind::Analysis => Box::new(AnalysisArgParser::new()?),
        })
    }

    /// Glob matching the job output files for a postfix `_<channel><tag>`.
    pub fn output_pattern(self, postfix: &str) -> String {
        match self {
            ChannelKind::Skim => format!("*{}.root", postfix),
            ChannelKind::Analysis => format!("*{}_[0-9]*.root", postfix),
        }
    }
}

/// Split files into consecutive chunks of at most `size` files.
pub fn chunkify(files: &[String], size: usize) -> Vec<Vec<String>> {
    files.chunks(size.max(1)).map(|c| c.to_vec()).collect()
}

/// Insert new chunks at the lowest indices not yet taken and return the
/// indices they got.
pub fn assign_chunks(chunkdict: &mut ChunkMap, fchunks: Vec<Vec<String>>) -> Vec<usize> {
    let mut indices = Vec::with_capacity(fchunks.len());
    let mut ichunk = 0;
    for fchunk in fchunks {
        while chunkdict.contains_key(&ichunk) {
            ichunk += 1;
        }
        chunkdict.insert(ichunk, fchunk);
        indices.push(ichunk);
    }
    indices
}
