//! Recover the chunk a running job works on from its command line.

use regex::Regex;

use crate::errors::PicoError;
use crate::models::ChunkMap;

/// Parses the job command line written to the argument list back into the
/// chunk index it was generated for.
pub trait ChunkArgParser: Send + Sync {
    fn parse_chunk_from_args(&self, raw_args: &str, chunks: &ChunkMap) -> Result<usize, PicoError>;
}

/// Analysis jobs carry the chunk index in their output tag, `-t _mutau_3`.
pub struct AnalysisArgParser {
    flag: Regex,
}

impl AnalysisArgParser {
    pub fn new() -> Result<Self, PicoError> {
        let flag = Regex::new(r"-t \w*_(\d+)")
            .map_err(|e| PicoError::Validation(format!("Invalid argument pattern: {}", e)))?;
        Ok(Self { flag })
    }
}

impl ChunkArgParser for AnalysisArgParser {
    fn parse_chunk_from_args(&self, raw_args: &str, chunks: &ChunkMap) -> Result<usize, PicoError> {
        let index = self
            .flag
            .captures(raw_args)
            .and_then(|caps| caps[1].parse::<usize>().ok())
            .ok_or_else(|| {
                PicoError::Integrity(format!(
                    "Could not find a chunk index in job arguments {:?}",
                    raw_args.trim_end()
                ))
            })?;
        if !chunks.contains_key(&index) {
            return Err(PicoError::Integrity(format!(
                "Found an impossible chunk {} in job arguments {:?}! Possible overcounting!",
                index,
                raw_args.trim_end()
            )));
        }
        Ok(index)
    }
}

/// Skim jobs are identified by their input files, `-i a.root b.root`.
pub struct SkimArgParser {
    flag: Regex,
}

impl SkimArgParser {
    pub fn new() -> Result<Self, PicoError> {
        let flag = Regex::new(r"-i (.+\.root)")
            .map_err(|e| PicoError::Validation(format!("Invalid argument pattern: {}", e)))?;
        Ok(Self { flag })
    }
}

impl ChunkArgParser for SkimArgParser {
    fn parse_chunk_from_args(&self, raw_args: &str, chunks: &ChunkMap) -> Result<usize, PicoError> {
        let infiles: Vec<&str> = self
            .flag
            .captures(raw_args)
            .map(|caps| {
                caps.get(1)
                    .map(|m| m.as_str())
                    .unwrap_or("")
                    .split_whitespace()
                    .take_while(|f| f.ends_with(".root"))
                    .collect()
            })
            .unwrap_or_default();
        if infiles.is_empty() {
            return Err(PicoError::Integrity(format!(
                "Did not find any root files in job arguments {:?}",
                raw_args.trim_end()
            )));
        }
        let (index, files) = chunks
            .iter()
            .find(|(_, files)| infiles.iter().all(|f| files.iter().any(|cf| cf == f)))
            .ok_or_else(|| {
                PicoError::Integrity(format!(
                    "Did not find to which chunk the input files {:?} belong!",
                    infiles
                ))
            })?;
        if files.len() != infiles.len() {
            return Err(PicoError::Integrity(format!(
                "Mismatch between input files {:?} of a job and chunk {} with {} files!",
                infiles,
                index,
                files.len()
            )));
        }
        Ok(*index)
    }
}
