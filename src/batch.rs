// batch.rs
// ============================================================================
// Note:  Batch tensorizer. Converts raw example records into the fixed-shape
//        ndarray tensors the network consumes. Every token occurrence gets a
//        dual index: an embedding-safe id (fixed vocabulary or UNK, valid as
//        an embedding row) and a copy id into the extended vocabulary (may
//        point at the batch's dynamic segment). A target copy id that does
//        not occur among the same example's source copy ids is downgraded to
//        UNK, otherwise the copy channel would assign probability mass to a
//        slot the attention can never reach.
// ============================================================================

#![forbid(unsafe_code)]

use ndarray::{Array1, Array2};
use std::cmp::{Ordering, Reverse};
use std::collections::HashSet;

use crate::vocab::{EOS_TOKEN, PAD_IDX, UNK_IDX, Vocab};

#[derive(Clone, Debug, Default)]
pub struct Example {
    pub review: String,
    pub summary: String,
    pub user: String,
    pub product: String,
    pub memory: Vec<MemoryEntry>,
}

/// One related historical review, identified by its index into the full
/// training corpus. Ownership flags are derived at tensorization time.
#[derive(Clone, Debug)]
pub struct MemoryEntry {
    pub source: usize,
    pub score: f32,
    pub gold: f32,
}

/// Dual index of one token occurrence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenIdx {
    /// Always has an embedding row: fixed-vocabulary id or UNK.
    pub embed_id: usize,
    /// Extended-vocabulary id, the copy target.
    pub copy_id: usize,
}

pub struct BatchTensors {
    /// Extended source ids, [batch, src_max].
    pub src: Array2<usize>,
    /// Embedding-safe source ids, [batch, src_max].
    pub src_embed: Array2<usize>,
    /// Extended target ids (copy-reachability enforced), [batch, sum_max_len].
    pub trg: Array2<usize>,
    /// Embedding-safe target ids, [batch, sum_max_len].
    pub trg_embed: Array2<usize>,
    /// 1.0 on real source tokens, 0.0 on padding, [batch, src_max].
    pub src_mask: Array2<f32>,
    pub src_lens: Vec<usize>,
    pub trg_lens: Vec<usize>,
    pub users: Vec<usize>,
    pub products: Vec<usize>,
    /// Extended vocabulary size for this batch, fixed + dynamic.
    pub vocab_size: usize,
    /// Original text in batch order, for inspection during validation.
    pub src_text: Vec<String>,
    pub trg_text: Vec<String>,
}

pub struct MemoryTensors {
    /// [is-same-user, is-same-product] per row, [batch * mem_size, 2].
    pub mem_up: Array2<f32>,
    /// Memory review ids, embedding-safe, [batch * mem_size, review_max_len].
    pub mem_review: Array2<usize>,
    /// Memory summary ids, embedding-safe, [batch * mem_size, sum_max_len].
    pub mem_sum: Array2<usize>,
    /// Gold relevance per row, [batch * mem_size].
    pub mem_gold: Array1<f32>,
}

impl Vocab {
    /// Tensorize one batch. Resets the dynamic segment from the previous
    /// batch, sorts examples by descending source length, extends the
    /// dynamic segment from the sorted sources, and builds all id tensors.
    pub fn read_batch(&mut self, batch: &[Example]) -> BatchTensors {
        assert!(!batch.is_empty(), "empty batch");
        self.begin_batch();

        let i_src_cap = self.config().src_max_len;
        let i_trg_max = self.config().sum_max_len;

        // Sort by descending source token count; the recurrent encoder wants
        // the longest sequence first.
        let mut v_tokens: Vec<Vec<String>> = batch
            .iter()
            .map(|ex| {
                ex.review
                    .split_whitespace()
                    .take(i_src_cap)
                    .map(str::to_string)
                    .collect()
            })
            .collect();
        let mut order: Vec<usize> = (0..batch.len()).collect();
        order.sort_by_key(|&i| Reverse(v_tokens[i].len()));
        let v_tokens: Vec<Vec<String>> = order.iter().map(|&i| std::mem::take(&mut v_tokens[i])).collect();
        let sorted: Vec<&Example> = order.iter().map(|&i| &batch[i]).collect();

        // Grow the dynamic segment from every source token in the batch.
        for tokens in &v_tokens {
            for s_tok in tokens {
                self.add_dynamic(s_tok);
            }
        }

        let i_batch = sorted.len();
        let i_src_max = v_tokens[0].len();
        let i_fixed = self.fixed_count();

        let mut src = Array2::<usize>::from_elem((i_batch, i_src_max), PAD_IDX);
        let mut src_embed = Array2::<usize>::from_elem((i_batch, i_src_max), PAD_IDX);
        let mut src_mask = Array2::<f32>::zeros((i_batch, i_src_max));
        let mut src_lens = Vec::with_capacity(i_batch);
        let mut src_id_sets: Vec<HashSet<usize>> = Vec::with_capacity(i_batch);

        for (i_row, tokens) in v_tokens.iter().enumerate() {
            let mut ids = HashSet::with_capacity(tokens.len());
            for (i_col, s_tok) in tokens.iter().enumerate() {
                let tok = self.token_idx(s_tok);
                src[(i_row, i_col)] = tok.copy_id;
                src_embed[(i_row, i_col)] = tok.embed_id;
                src_mask[(i_row, i_col)] = 1.0;
                ids.insert(tok.copy_id);
            }
            src_lens.push(tokens.len());
            src_id_sets.push(ids);
        }

        let mut trg = Array2::<usize>::from_elem((i_batch, i_trg_max), PAD_IDX);
        let mut trg_embed = Array2::<usize>::from_elem((i_batch, i_trg_max), PAD_IDX);
        let mut trg_lens = Vec::with_capacity(i_batch);

        for (i_row, ex) in sorted.iter().enumerate() {
            // Overlong summaries are truncated silently, fixed-size tensors
            // are the contract.
            let mut tokens: Vec<&str> = ex.summary.split_whitespace().collect();
            tokens.push(EOS_TOKEN);
            tokens.truncate(i_trg_max);
            for (i_col, s_tok) in tokens.iter().enumerate() {
                let mut i_copy = self.word_id(s_tok);
                if i_copy >= i_fixed && !src_id_sets[i_row].contains(&i_copy) {
                    // Not copyable from this example's source.
                    i_copy = UNK_IDX;
                }
                trg[(i_row, i_col)] = i_copy;
                trg_embed[(i_row, i_col)] = if i_copy < i_fixed { i_copy } else { UNK_IDX };
            }
            trg_lens.push(tokens.len());
        }

        let users: Vec<usize> = sorted.iter().map(|ex| self.user_id(&ex.user)).collect();
        let products: Vec<usize> = sorted.iter().map(|ex| self.product_id(&ex.product)).collect();

        BatchTensors {
            src,
            src_embed,
            trg,
            trg_embed,
            src_mask,
            src_lens,
            trg_lens,
            users,
            products,
            vocab_size: self.total_count(),
            src_text: sorted.iter().map(|ex| ex.review.clone()).collect(),
            trg_text: sorted.iter().map(|ex| ex.summary.clone()).collect(),
        }
    }

    /// Memory-augmented variant. Every example contributes exactly
    /// `mem_size` flat memory rows, in batch order, so consumers recover the
    /// per-example grouping by stride. Shortfall is padded with zero rows.
    pub fn read_batch_with_memory(
        &mut self,
        batch: &[Example],
        corpus: &[Example],
    ) -> (BatchTensors, MemoryTensors) {
        let tensors = self.read_batch(batch);

        let i_mem = self.config().mem_size;
        let i_review_max = self.config().review_max_len;
        let i_sum_max = self.config().sum_max_len;
        let i_rows = tensors.src_lens.len() * i_mem;

        let mut mem_up = Array2::<f32>::zeros((i_rows, 2));
        let mut mem_review = Array2::<usize>::from_elem((i_rows, i_review_max), PAD_IDX);
        let mut mem_sum = Array2::<usize>::from_elem((i_rows, i_sum_max), PAD_IDX);
        let mut mem_gold = Array1::<f32>::zeros(i_rows);

        // read_batch already sorted the batch; reproduce its order here.
        let mut order: Vec<usize> = (0..batch.len()).collect();
        order.sort_by_key(|&i| {
            Reverse(batch[i].review.split_whitespace().take(self.config().src_max_len).count())
        });

        for (i_ex, &i_orig) in order.iter().enumerate() {
            let ex = &batch[i_orig];
            let mut mem = ex.memory.clone();
            // Highest relevance first, then cut to capacity.
            mem.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
            mem.truncate(i_mem);

            for (i_slot, entry) in mem.iter().enumerate() {
                let i_row = i_ex * i_mem + i_slot;
                assert!(
                    entry.source < corpus.len(),
                    "memory entry points at example {} outside corpus of {}",
                    entry.source,
                    corpus.len()
                );
                let data = &corpus[entry.source];
                let b_user = data.user == ex.user;
                let b_product = data.product == ex.product;
                // A memory entry relevant to neither identity axis is a
                // data-generation bug, not a runtime condition.
                assert!(
                    b_user || b_product,
                    "memory entry {} matches neither user '{}' nor product '{}'",
                    entry.source,
                    ex.user,
                    ex.product
                );
                mem_up[(i_row, 0)] = if b_user { 1.0 } else { 0.0 };
                mem_up[(i_row, 1)] = if b_product { 1.0 } else { 0.0 };
                mem_gold[i_row] = entry.gold;

                for (i_col, s_tok) in
                    data.review.split_whitespace().take(i_review_max).enumerate()
                {
                    mem_review[(i_row, i_col)] = self.fixed_word_id(s_tok);
                }
                for (i_col, s_tok) in data.summary.split_whitespace().take(i_sum_max).enumerate() {
                    mem_sum[(i_row, i_col)] = self.fixed_word_id(s_tok);
                }
            }
        }

        (tensors, MemoryTensors { mem_up, mem_review, mem_sum, mem_gold })
    }

    /// Dual index for one source token occurrence.
    fn token_idx(&self, s_tok: &str) -> TokenIdx {
        let i_copy = self.word_id(s_tok);
        let i_embed = if i_copy < self.fixed_count() { i_copy } else { UNK_IDX };
        TokenIdx { embed_id: i_embed, copy_id: i_copy }
    }

    /// Embedding-safe lookup, never returns a dynamic id.
    fn fixed_word_id(&self, s_tok: &str) -> usize {
        let i_id = self.word_id(s_tok);
        if i_id < self.fixed_count() { i_id } else { UNK_IDX }
    }
}
