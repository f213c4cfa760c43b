// Word-level vocabulary with fixed control-token ids. Token ids are dense
// u32 indices into a single word table; the first four slots are reserved
// and stable across save/load so that checkpoints and metadata created by
// different runs agree on what padding means.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, ensure, Result};

pub const TOK_PAD: u32 = 0;
pub const TOK_UNK: u32 = 1;
pub const TOK_SOS: u32 = 2;
pub const TOK_EOS: u32 = 3;

const RESERVED: [&str; 4] = ["<pad>", "<unk>", "<sos>", "<eos>"];

#[derive(Debug, Clone)]
pub struct Vocabulary {
    words: Vec<String>,
    word2id: HashMap<String, u32>,
}

impl Vocabulary {
    /// Vocabulary containing only the four reserved control tokens.
    pub fn new() -> Self {
        let mut vocab = Vocabulary {
            words: Vec::new(),
            word2id: HashMap::new(),
        };
        for word in RESERVED {
            vocab.push_word(word);
        }
        vocab
    }

    /// Builds a vocabulary from word frequencies. Words below `min_count`
    /// are dropped and map to `<unk>` at encode time. Ordering is
    /// frequency-descending with an alphabetical tie-break, so the same
    /// counts always produce the same id assignment.
    pub fn from_counts(counts: &HashMap<String, usize>, min_count: usize) -> Self {
        let mut vocab = Vocabulary::new();
        let mut entries: Vec<(&String, usize)> = counts
            .iter()
            .filter(|(word, &count)| count >= min_count && !RESERVED.contains(&word.as_str()))
            .map(|(word, &count)| (word, count))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        for (word, _) in entries {
            vocab.push_word(word);
        }
        vocab
    }

    fn push_word(&mut self, word: &str) -> u32 {
        if let Some(&id) = self.word2id.get(word) {
            return id;
        }
        let id = self.words.len() as u32;
        self.words.push(word.to_string());
        self.word2id.insert(word.to_string(), id);
        id
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Id for a word, falling back to `<unk>` for out-of-vocabulary words.
    pub fn id_for(&self, word: &str) -> u32 {
        self.word2id.get(word).copied().unwrap_or(TOK_UNK)
    }

    /// Word for an id. Unknown ids are an error: they indicate a vocabulary
    /// and a tensor that were produced by different runs.
    pub fn index_to_word(&self, id: u32) -> Result<&str> {
        match self.words.get(id as usize) {
            Some(word) => Ok(word.as_str()),
            None => bail!(
                "token id {} not in vocabulary ({} entries)",
                id,
                self.words.len()
            ),
        }
    }

    /// Encodes an utterance as `<sos> words... <eos>` padded to `max_len`.
    /// Returns the padded ids and the unpadded length. Utterances that do
    /// not fit are truncated, keeping the trailing `<eos>`.
    pub fn encode_utterance(&self, utterance: &str, max_len: usize) -> (Vec<u32>, usize) {
        assert!(max_len >= 2, "max_len must fit <sos> and <eos>");
        let mut ids = vec![TOK_SOS];
        for word in utterance.split_whitespace() {
            ids.push(self.id_for(word));
        }
        ids.push(TOK_EOS);
        if ids.len() > max_len {
            ids.truncate(max_len);
            ids[max_len - 1] = TOK_EOS;
        }
        let length = ids.len();
        ids.resize(max_len, TOK_PAD);
        (ids, length)
    }

    /// Human-readable form of a padded id sequence, control tokens elided.
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter(|&&id| id != TOK_PAD && id != TOK_SOS && id != TOK_EOS)
            .filter_map(|&id| self.words.get(id as usize))
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.words)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let words: Vec<String> = serde_json::from_str(&json)?;
        ensure!(
            words.len() >= RESERVED.len(),
            "vocabulary file {} is missing reserved tokens",
            path.display()
        );
        for (i, reserved) in RESERVED.iter().enumerate() {
            ensure!(
                words[i] == *reserved,
                "vocabulary file {} has {:?} at slot {}, expected {:?}",
                path.display(),
                words[i],
                i,
                reserved
            );
        }
        let mut word2id = HashMap::with_capacity(words.len());
        for (i, word) in words.iter().enumerate() {
            word2id.insert(word.clone(), i as u32);
        }
        Ok(Vocabulary { words, word2id })
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new()
    }
}
