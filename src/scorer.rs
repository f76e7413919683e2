//! Incremental chart scorer for CKY-style decoding.
//!
//! A chart state is two halves: a pending prefix (left-exposed words whose
//! scores are still tentative upper bounds) and the flat suffix state of the
//! right edge, plus a completeness flag. Combining hypotheses replays the
//! right antecedent's pending words against the left's suffix, upgrading
//! bounds to exact scores as full contexts become available. The scorer
//! accumulates only the adjustment of the operations applied to it; the
//! antecedents' own totals are the decoder's business.

use crate::model::{NGram, NodeRef, SuffixState};
use crate::vocab::{WordId, BOS_ID};

#[derive(Clone, Debug)]
pub struct PrefixEntry {
    pub word: WordId,
    pub node: Option<NodeRef>,
    pub bound: f32,
}

#[derive(Clone, Default, Debug)]
pub struct ChartState {
    /// Pending words awaiting left context, leftmost first, at most N-1.
    pub prefix: Vec<PrefixEntry>,
    /// Flat state of the right edge.
    pub suffix: SuffixState,
    /// True once no further left context can rescore the prefix.
    pub complete: bool,
}

impl ChartState {
    pub fn fresh() -> ChartState {
        ChartState::default()
    }
}

pub struct ChartScorer<'a> {
    model: &'a NGram,
    state: ChartState,
    total: f64,
}

impl<'a> ChartScorer<'a> {
    pub fn new(model: &'a NGram) -> ChartScorer<'a> {
        ChartScorer {
            model,
            state: ChartState::fresh(),
            total: 0.0,
        }
    }

    pub fn state(&self) -> &ChartState {
        &self.state
    }

    pub fn total(&self) -> f32 {
        self.total as f32
    }

    /// Consume the scorer: mark the state complete and hand back the state
    /// together with the accumulated adjustment.
    pub fn finish(mut self) -> (ChartState, f32) {
        self.state.complete = true;
        (self.state, self.total as f32)
    }

    /// Seed the suffix with `<s>`; a sentence-initial hypothesis is complete
    /// from the start, there is nothing further to its left.
    pub fn initial_bos(&mut self) {
        self.state.suffix = self.model.lookup_context(&[BOS_ID]);
        self.state.complete = true;
    }

    /// Seed the suffix from an existing flat state and mark complete.
    pub fn initial_bos_from(&mut self, suffix: &SuffixState) {
        self.state.suffix = suffix.clone();
        self.state.complete = true;
    }

    /// Left-most antecedent: copy it verbatim.
    pub fn initial_non_terminal(&mut self, antecedent: &ChartState) {
        self.state = antecedent.clone();
    }

    /// Extend by one terminal word.
    pub fn terminal(&mut self, word: WordId) {
        let prev_len = self.state.suffix.len();
        let (next, result) = self.model.ngram_score(&self.state.suffix, word);
        if self.state.complete || result.complete {
            self.total += result.exact as f64;
            self.state.complete = true;
        } else {
            self.total += result.bound as f64;
            self.state.prefix.push(PrefixEntry {
                word,
                node: result.node,
                bound: result.bound,
            });
            // The suffix chain must grow by exactly one per word while the
            // hypothesis is still open; an internal back-off closes it.
            if next.len() != prev_len + 1 {
                self.state.complete = true;
            }
        }
        self.state.suffix = next;
    }

    /// Splice an antecedent's prefix and suffix onto the right of this state.
    pub fn non_terminal(&mut self, antecedent: &ChartState) {
        if antecedent.prefix.is_empty() {
            if antecedent.complete {
                // Nothing on the right can be rescored anymore, so every
                // back-off our right edge still promised is charged now.
                for b in self.state.suffix.backoffs() {
                    self.total += *b as f64;
                }
                self.state.suffix = antecedent.suffix.clone();
                self.state.complete = true;
            }
            return;
        }

        if self.state.suffix.is_empty() {
            // No left context to offer: adopt the antecedent wholesale.
            if !self.state.complete && self.state.prefix.is_empty() {
                self.state.prefix = antecedent.prefix.clone();
                self.state.suffix = antecedent.suffix.clone();
                self.state.complete = antecedent.complete;
            } else {
                self.state.suffix = antecedent.suffix.clone();
                self.state.complete = true;
            }
            return;
        }

        // Replay the pending words against our right edge, upgrading the
        // previously charged bounds. `cur` and `next` alternate so a replay
        // never reads the buffer it is writing. Every pending word is
        // replayed: its history is the concatenation regardless of how the
        // words before it matched.
        let mut cur = self.state.suffix.clone();
        for entry in &antecedent.prefix {
            let (next, result) = self.model.ngram_score(&cur, entry.word);
            if self.state.complete || result.complete {
                self.total += (result.exact - entry.bound) as f64;
                self.state.complete = true;
            } else {
                self.total += (result.bound - entry.bound) as f64;
                self.state.prefix.push(PrefixEntry {
                    word: entry.word,
                    node: result.node,
                    bound: result.bound,
                });
            }
            cur = next;
        }

        if antecedent.complete {
            // Words past the pending prefix were scored with their full
            // internal history; only contexts reaching further left than
            // that prefix still owe their back-offs.
            for l in antecedent.prefix.len()..cur.len() {
                self.total += cur.backoffs()[l] as f64;
            }
            self.state.suffix = antecedent.suffix.clone();
            self.state.complete = true;
            return;
        }

        if antecedent.suffix.len() < antecedent.prefix.len() {
            // Minimal suffix: independent of anything to the left.
            self.state.suffix = antecedent.suffix.clone();
            return;
        }

        // The replayed chain is the right edge of the concatenation, with
        // its back-off weights recomputed exactly.
        self.state.suffix = cur;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ModelBuilder;
    use crate::model::NGram;

    fn model() -> NGram {
        let mut b = ModelBuilder::new(3, 2);
        b.ngram(&["<s>"], crate::model::DEFAULT_SMOOTH, -0.35);
        b.ngram(&["</s>"], -2.1, 0.0);
        b.ngram(&["a"], -1.0, -0.5);
        b.ngram(&["b"], -1.2, -0.4);
        b.ngram(&["c"], -1.4, -0.3);
        b.ngram(&["<s>", "a"], -0.6, -0.25);
        b.ngram(&["a", "b"], -0.7, -0.3);
        b.ngram(&["b", "c"], -0.9, -0.2);
        b.ngram(&["c", "</s>"], -1.1, 0.0);
        b.ngram(&["<s>", "a", "b"], -0.45, 0.0);
        b.ngram(&["a", "b", "c"], -0.2, 0.0);
        b.ngram(&["b", "c", "</s>"], -0.8, 0.0);
        b.build().unwrap()
    }

    fn ids(model: &NGram, words: &[&str]) -> Vec<u32> {
        words.iter().map(|w| model.vocab.lookup(w)).collect()
    }

    #[test]
    fn left_to_right_matches_flat_scoring() {
        let m = model();
        let sentence = ids(&m, &["<s>", "a", "b", "c", "</s>"]);
        let flat = m.score(&sentence, 0);

        let mut scorer = ChartScorer::new(&m);
        scorer.initial_bos();
        for &w in &sentence[1..] {
            scorer.terminal(w);
        }
        let (state, total) = scorer.finish();
        assert!(state.complete);
        assert!((total - flat).abs() < 1e-5, "chart {total} flat {flat}");
    }

    #[test]
    fn split_hypotheses_recombine_to_the_flat_score() {
        let m = model();
        let sentence = ids(&m, &["<s>", "a", "b", "c", "</s>"]);
        let flat = m.score(&sentence, 0) as f64;

        for split in 2..sentence.len() {
            // Left: <s> .. split; right: the rest, scored blind.
            let mut left = ChartScorer::new(&m);
            left.initial_bos();
            for &w in &sentence[1..split] {
                left.terminal(w);
            }
            let left_total = left.total() as f64;
            let (left_state, _) = left.finish();

            let mut right = ChartScorer::new(&m);
            for &w in &sentence[split..] {
                right.terminal(w);
            }
            let right_total = right.total() as f64;
            let right_state = right.state().clone();

            let mut combined = ChartScorer::new(&m);
            combined.initial_non_terminal(&left_state);
            combined.non_terminal(&right_state);
            let adjust = combined.total() as f64;
            let (state, _) = combined.finish();

            assert!(state.complete, "split {split} not complete");
            let total = left_total + right_total + adjust;
            assert!(
                (total - flat).abs() < 1e-4,
                "split {split}: {total} vs {flat}"
            );
        }
    }

    #[test]
    fn terminal_backoff_closes_the_state() {
        let m = model();
        // "c a" has no stored bigram, so scoring a after c backs off.
        let mut scorer = ChartScorer::new(&m);
        let c = m.vocab.lookup("c");
        let a = m.vocab.lookup("a");
        scorer.terminal(c);
        assert!(!scorer.state().complete);
        assert_eq!(scorer.state().prefix.len(), 1);
        scorer.terminal(a);
        assert!(scorer.state().complete);
    }

    #[test]
    fn merging_with_a_complete_right_charges_pending_backoffs() {
        let m = model();
        // Left ends in "b c"; right is sentence-initial (complete, empty
        // prefix) — merge must charge the left suffix's recorded back-offs.
        let mut left = ChartScorer::new(&m);
        left.terminal(m.vocab.lookup("b"));
        left.terminal(m.vocab.lookup("c"));
        let (left_state, _) = left.finish();
        let promised: f32 = left_state.suffix.backoffs().iter().sum();

        let mut bos = ChartScorer::new(&m);
        bos.initial_bos();
        let (bos_state, _) = bos.finish();

        let mut combined = ChartScorer::new(&m);
        combined.initial_non_terminal(&left_state);
        combined.non_terminal(&bos_state);
        assert!((combined.total() - promised).abs() < 1e-6);
        assert_eq!(combined.state().suffix.ids(), bos_state.suffix.ids());
    }
}
