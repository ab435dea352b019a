//! Decayed n-gram next-action prediction.
//!
//! Two frequency tables over the "started after" token stream: bigram (one
//! token of history) and trigram (two). On every observation the context's
//! existing counts are multiplied by the decay factor before the observed
//! transition is incremented, so recent behavior dominates. Prediction ranks
//! trigram continuations first and fills remaining slots from the bigram
//! table.

use std::collections::HashMap;
use std::hash::Hash;

fn decay_and_bump<K: Eq + Hash + Clone>(counts: &mut HashMap<K, f64>, next: K, decay: f64) {
    for value in counts.values_mut() {
        *value *= decay;
    }
    *counts.entry(next).or_insert(0.0) += 1.0;
}

fn ranked<K: Ord + Clone>(counts: &HashMap<K, f64>) -> Vec<K>
where
    K: Eq + Hash,
{
    let mut pairs: Vec<(&K, f64)> = counts.iter().map(|(k, v)| (k, *v)).collect();
    pairs.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });
    pairs.into_iter().map(|(k, _)| k.clone()).collect()
}

pub struct BiGramPredictor<K> {
    counts: HashMap<K, HashMap<K, f64>>,
    last: Option<K>,
    decay: f64,
}

impl<K: Eq + Hash + Ord + Clone> BiGramPredictor<K> {
    pub fn new(decay: f64) -> Self {
        Self {
            counts: HashMap::new(),
            last: None,
            decay,
        }
    }

    pub fn fit(&mut self, token: K) {
        if let Some(context) = self.last.take() {
            let counts = self.counts.entry(context).or_default();
            decay_and_bump(counts, token.clone(), self.decay);
        }
        self.last = Some(token);
    }

    /// Continuations of the latest token, best first.
    pub fn predict(&self) -> Vec<K> {
        let Some(context) = &self.last else {
            return Vec::new();
        };
        self.counts.get(context).map(ranked).unwrap_or_default()
    }
}

pub struct TriGramPredictor<K> {
    counts: HashMap<(K, K), HashMap<K, f64>>,
    history: Vec<K>,
    decay: f64,
}

impl<K: Eq + Hash + Ord + Clone> TriGramPredictor<K> {
    pub fn new(decay: f64) -> Self {
        Self {
            counts: HashMap::new(),
            history: Vec::new(),
            decay,
        }
    }

    pub fn fit(&mut self, token: K) {
        if let [older, newer] = &self.history[..] {
            let context = (older.clone(), newer.clone());
            let counts = self.counts.entry(context).or_default();
            decay_and_bump(counts, token.clone(), self.decay);
        }
        self.history.push(token);
        if self.history.len() > 2 {
            self.history.remove(0);
        }
    }

    /// Continuations of the latest two tokens, best first. Empty until two
    /// tokens have been observed.
    pub fn predict(&self) -> Vec<K> {
        let [older, newer] = &self.history[..] else {
            return Vec::new();
        };
        self.counts
            .get(&(older.clone(), newer.clone()))
            .map(ranked)
            .unwrap_or_default()
    }
}

/// Rank by trigram score, fill remaining slots by bigram score, apply the
/// eligibility filter, keep the top `n`.
pub fn predict_top_n<K: Eq + Hash + Ord + Clone>(
    trigram: &TriGramPredictor<K>,
    bigram: &BiGramPredictor<K>,
    n: usize,
    mut eligible: impl FnMut(&K) -> bool,
) -> Vec<K> {
    let mut picked: Vec<K> = trigram
        .predict()
        .into_iter()
        .filter(|k| eligible(k))
        .take(n)
        .collect();
    if picked.len() < n {
        for candidate in bigram.predict() {
            if picked.len() >= n {
                break;
            }
            if !picked.contains(&candidate) && eligible(&candidate) {
                picked.push(candidate);
            }
        }
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bigram_learns_transitions() {
        let mut bigram = BiGramPredictor::new(0.9);
        for _ in 0..3 {
            bigram.fit("a");
            bigram.fit("b");
        }
        bigram.fit("a");
        assert_eq!(bigram.predict(), vec!["b"]);
    }

    #[test]
    fn trigram_needs_two_tokens_of_history() {
        let mut trigram = TriGramPredictor::new(0.9);
        trigram.fit("a");
        assert!(trigram.predict().is_empty());
        trigram.fit("b");
        trigram.fit("c");
        // history now (b, c): unseen context.
        assert!(trigram.predict().is_empty());
        // Teach (b, c) -> a, then replay the context.
        trigram.fit("b");
        trigram.fit("c");
        trigram.fit("a");
        trigram.fit("b");
        trigram.fit("c");
        assert_eq!(trigram.predict(), vec!["a"]);
    }

    #[test]
    fn decay_lets_recent_behavior_win() {
        let mut bigram = BiGramPredictor::new(0.5);
        // Old habit: a -> b, twice.
        bigram.fit("a");
        bigram.fit("b");
        bigram.fit("a");
        bigram.fit("b");
        // New habit: a -> c, three times; decay halves the old counts on
        // each observation of the context.
        for _ in 0..3 {
            bigram.fit("a");
            bigram.fit("c");
        }
        bigram.fit("a");
        assert_eq!(bigram.predict()[0], "c");
    }

    #[test]
    fn top_n_falls_back_to_bigram_and_filters() {
        let mut trigram = TriGramPredictor::new(0.9);
        let mut bigram = BiGramPredictor::new(0.9);
        for token in ["a", "b", "c", "a", "b", "d", "a", "b"] {
            trigram.fit(token);
            bigram.fit(token);
        }
        // Trigram context (a, b) knows c and d; bigram context b adds its
        // own ranking. Exclude c: d must fill from either table.
        let picked = predict_top_n(&trigram, &bigram, 2, |k| *k != "c");
        assert_eq!(picked[0], "d");
        assert!(!picked.contains(&"c"));
    }
}
