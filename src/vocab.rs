// vocab.rs
// ============================================================================
// Note:  Vocabulary manager with a fixed segment and a batch-scoped dynamic
//        segment. The fixed segment is built during the corpus scan and
//        compacted once by trim(); each id owns an embedding row and a
//        frequency count. The dynamic segment holds out-of-vocabulary words
//        from the current batch's source side only: no frequency, no
//        embedding, copy targets only. It is torn down again by
//        begin_batch()/end_batch() so no batch ever observes another batch's
//        ids. User and product registries grow monotonically, id 0 reserved
//        for unknown.
// ============================================================================

#![forbid(unsafe_code)]

use ndarray::Array2;
use rand_distr::{Distribution, Normal};
use std::collections::{BTreeMap, HashMap};

use crate::config::Config;

pub const PAD_IDX: usize = 0;
pub const SOS_IDX: usize = 1;
pub const EOS_IDX: usize = 2;
pub const UNK_IDX: usize = 3;

pub const PAD_TOKEN: &str = "<PAD>";
pub const SOS_TOKEN: &str = "<SOS>";
pub const EOS_TOKEN: &str = "<EOS>";
pub const UNK_TOKEN: &str = "<UNK>";

pub const UNK_USER: &str = "<UNK-USER>";
pub const UNK_PRODUCT: &str = "<UNK-PRODUCT>";

// Reserved tokens get an inflated count so trim() can never prune them.
const RESERVED_CNT: u64 = 10_000;

pub struct Vocab {
    cfg: Config,

    word2id: HashMap<String, usize>,
    id2word: Vec<String>,
    // Frequency and embedding rows exist for the fixed segment only.
    word2cnt: HashMap<String, u64>,
    embed: Vec<Vec<f32>>,

    fixed_num: usize,

    user2id: HashMap<String, usize>,
    id2user: Vec<String>,
    product2id: HashMap<String, usize>,
    id2product: Vec<String>,
}

impl Vocab {
    pub fn new(cfg: &Config) -> Self {
        let mut vocab = Self {
            cfg: cfg.clone(),
            word2id: HashMap::new(),
            id2word: Vec::new(),
            word2cnt: HashMap::new(),
            embed: Vec::new(),
            fixed_num: 0,
            user2id: HashMap::new(),
            id2user: Vec::new(),
            product2id: HashMap::new(),
            id2product: Vec::new(),
        };
        for s_tok in [PAD_TOKEN, SOS_TOKEN, EOS_TOKEN, UNK_TOKEN] {
            let i_id = vocab.id2word.len();
            vocab.word2id.insert(s_tok.to_string(), i_id);
            vocab.id2word.push(s_tok.to_string());
            vocab.word2cnt.insert(s_tok.to_string(), RESERVED_CNT);
            vocab.embed.push(random_embedding(cfg.embed_dim));
        }
        vocab.fixed_num = vocab.id2word.len();

        vocab.user2id.insert(UNK_USER.to_string(), 0);
        vocab.id2user.push(UNK_USER.to_string());
        vocab.product2id.insert(UNK_PRODUCT.to_string(), 0);
        vocab.id2product.push(UNK_PRODUCT.to_string());

        vocab.assert_parallel();
        vocab
    }

    /// Seed the fixed segment with pretrained vectors. Tokens are added in
    /// sorted order with frequency 0, so pretrained words that never occur
    /// in the corpus fall to trim() like any other rare word.
    pub fn with_pretrained(cfg: &Config, pretrained: &BTreeMap<String, Vec<f32>>) -> Self {
        let mut vocab = Self::new(cfg);
        for (s_tok, v_vec) in pretrained {
            assert_eq!(
                v_vec.len(),
                cfg.embed_dim,
                "pretrained vector for '{}' has dim {}, expected {}",
                s_tok,
                v_vec.len(),
                cfg.embed_dim
            );
            if !vocab.word2id.contains_key(s_tok) {
                let i_id = vocab.id2word.len();
                vocab.word2id.insert(s_tok.clone(), i_id);
                vocab.id2word.push(s_tok.clone());
                vocab.word2cnt.insert(s_tok.clone(), 0);
                vocab.embed.push(v_vec.clone());
            }
        }
        vocab.fixed_num = vocab.id2word.len();
        vocab.assert_parallel();
        vocab
    }

    // ------------------------------------------------------------------------
    // Corpus scan
    // ------------------------------------------------------------------------

    /// Register one whitespace-tokenized sentence. New words get the next id
    /// and a random embedding row, known words bump their count.
    pub fn add_sentence(&mut self, s_text: &str) {
        debug_assert_eq!(
            self.id2word.len(),
            self.fixed_num,
            "add_sentence with open dynamic segment"
        );
        for s_tok in s_text.split_whitespace() {
            if let Some(cnt) = self.word2cnt.get_mut(s_tok) {
                *cnt += 1;
            } else {
                let i_id = self.id2word.len();
                self.word2id.insert(s_tok.to_string(), i_id);
                self.id2word.push(s_tok.to_string());
                self.word2cnt.insert(s_tok.to_string(), 1);
                self.embed.push(random_embedding(self.cfg.embed_dim));
            }
        }
        self.fixed_num = self.id2word.len();
    }

    pub fn add_user(&mut self, s_user: &str) {
        if !self.user2id.contains_key(s_user) {
            self.user2id.insert(s_user.to_string(), self.id2user.len());
            self.id2user.push(s_user.to_string());
        }
    }

    pub fn add_product(&mut self, s_product: &str) {
        if !self.product2id.contains_key(s_product) {
            self.product2id.insert(s_product.to_string(), self.id2product.len());
            self.id2product.push(s_product.to_string());
        }
    }

    // ------------------------------------------------------------------------
    // Compaction
    // ------------------------------------------------------------------------

    /// Prune rare words, renumber ids densely preserving order, rebuild the
    /// embedding rows to match, and return them as one matrix. The four
    /// parallel structures must stay equal length at every step; a mismatch
    /// means the vocabulary is corrupted and mis-maps ids, so it is fatal.
    pub fn trim(&mut self) -> Array2<f32> {
        assert_eq!(
            self.id2word.len(),
            self.fixed_num,
            "trim with open dynamic segment"
        );
        self.assert_parallel();
        println!("original vocab size: {}", self.word2cnt.len());

        let mut reserved_idx: Vec<usize> = Vec::new();
        for (i_id, s_tok) in self.id2word.iter().enumerate() {
            if self.word2cnt[s_tok] >= self.cfg.word_min_cnt {
                reserved_idx.push(i_id);
            }
        }
        if self.cfg.max_vocab > 0 {
            reserved_idx.truncate(self.cfg.max_vocab);
        }

        let mut word2id = HashMap::with_capacity(reserved_idx.len());
        let mut id2word = Vec::with_capacity(reserved_idx.len());
        let mut word2cnt = HashMap::with_capacity(reserved_idx.len());
        let mut embed = Vec::with_capacity(reserved_idx.len());
        for &i_old in &reserved_idx {
            let s_tok = self.id2word[i_old].clone();
            word2id.insert(s_tok.clone(), id2word.len());
            id2word.push(s_tok.clone());
            word2cnt.insert(s_tok, self.word2cnt[&self.id2word[i_old]]);
            embed.push(self.embed[i_old].clone());
        }
        assert!(
            word2id.len() == id2word.len()
                && id2word.len() == word2cnt.len()
                && word2cnt.len() == embed.len(),
            "vocab integrity violated after trim"
        );

        self.word2id = word2id;
        self.id2word = id2word;
        self.word2cnt = word2cnt;
        self.embed = embed;
        self.fixed_num = self.id2word.len();
        println!("Vocab size: {}", self.fixed_num);

        let mut m_embed = Array2::<f32>::zeros((self.fixed_num, self.cfg.embed_dim));
        for (i_row, v_row) in self.embed.iter().enumerate() {
            for (i_col, &f_val) in v_row.iter().enumerate() {
                m_embed[(i_row, i_col)] = f_val;
            }
        }
        m_embed
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    pub fn word_id(&self, s_tok: &str) -> usize {
        self.word2id.get(s_tok).copied().unwrap_or(UNK_IDX)
    }

    pub fn id_word(&self, i_id: usize) -> &str {
        assert!(
            i_id < self.id2word.len(),
            "id {} out of range for vocab size {}",
            i_id,
            self.id2word.len()
        );
        &self.id2word[i_id]
    }

    pub fn user_id(&self, s_user: &str) -> usize {
        self.user2id.get(s_user).copied().unwrap_or(0)
    }

    pub fn product_id(&self, s_product: &str) -> usize {
        self.product2id.get(s_product).copied().unwrap_or(0)
    }

    pub fn fixed_count(&self) -> usize {
        self.fixed_num
    }

    pub(crate) fn config(&self) -> &Config {
        &self.cfg
    }

    /// Fixed plus current dynamic segment, the extended index space.
    pub fn total_count(&self) -> usize {
        self.id2word.len()
    }

    pub fn user_count(&self) -> usize {
        self.id2user.len()
    }

    pub fn product_count(&self) -> usize {
        self.id2product.len()
    }

    // ------------------------------------------------------------------------
    // Dynamic segment lifecycle
    // ------------------------------------------------------------------------

    /// Discard any dynamic segment left over from a previous batch.
    pub fn begin_batch(&mut self) {
        for i_id in self.fixed_num..self.id2word.len() {
            let s_tok = self.id2word[i_id].clone();
            self.word2id.remove(&s_tok);
        }
        self.id2word.truncate(self.fixed_num);
    }

    pub fn end_batch(&mut self) {
        self.begin_batch();
    }

    /// Append a source word to the dynamic segment. Returns the existing id
    /// when the word is already known, fixed or dynamic.
    pub(crate) fn add_dynamic(&mut self, s_tok: &str) -> usize {
        if let Some(&i_id) = self.word2id.get(s_tok) {
            return i_id;
        }
        let i_id = self.id2word.len();
        self.word2id.insert(s_tok.to_string(), i_id);
        self.id2word.push(s_tok.to_string());
        i_id
    }

    fn assert_parallel(&self) {
        assert!(
            self.word2id.len() == self.id2word.len()
                && self.id2word.len() == self.word2cnt.len()
                && self.word2cnt.len() == self.embed.len(),
            "vocab parallel structures diverged: {} / {} / {} / {}",
            self.word2id.len(),
            self.id2word.len(),
            self.word2cnt.len(),
            self.embed.len()
        );
    }
}

fn random_embedding(i_dim: usize) -> Vec<f32> {
    let mut rng = rand::rng();
    let normal = Normal::new(0.0, 0.02).expect("invalid normal distribution");
    (0..i_dim).map(|_| normal.sample(&mut rng)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg() -> Config {
        Config { embed_dim: 8, word_min_cnt: 1, ..Config::default() }
    }

    #[test]
    fn reserved_tokens_take_first_ids() {
        let vocab = Vocab::new(&small_cfg());
        assert_eq!(vocab.word_id(PAD_TOKEN), PAD_IDX);
        assert_eq!(vocab.word_id(SOS_TOKEN), SOS_IDX);
        assert_eq!(vocab.word_id(EOS_TOKEN), EOS_IDX);
        assert_eq!(vocab.word_id(UNK_TOKEN), UNK_IDX);
        assert_eq!(vocab.fixed_count(), 4);
    }

    #[test]
    fn scenario_a_b_c() {
        let mut vocab = Vocab::new(&small_cfg());
        vocab.add_sentence("a b c");
        let embed = vocab.trim();
        assert_eq!(vocab.word_id("a"), 4);
        assert_eq!(vocab.word_id("b"), 5);
        assert_eq!(vocab.word_id("c"), 6);
        assert_eq!(vocab.fixed_count(), 7);
        assert_eq!(embed.dim(), (7, 8));
    }

    #[test]
    fn unknown_word_maps_to_unk() {
        let mut vocab = Vocab::new(&small_cfg());
        vocab.add_sentence("a b c");
        assert_eq!(vocab.word_id("zzz"), UNK_IDX);
    }

    #[test]
    fn trim_prunes_rare_words_and_renumbers() {
        let cfg = Config { embed_dim: 4, word_min_cnt: 2, ..Config::default() };
        let mut vocab = Vocab::new(&cfg);
        vocab.add_sentence("apple apple banana");
        vocab.add_sentence("apple cherry cherry");
        let embed = vocab.trim();
        // banana occurs once, pruned; apple and cherry renumbered densely.
        assert_eq!(vocab.word_id("banana"), UNK_IDX);
        assert_eq!(vocab.word_id("apple"), 4);
        assert_eq!(vocab.word_id("cherry"), 5);
        assert_eq!(vocab.fixed_count(), 6);
        assert_eq!(embed.nrows(), 6);
    }

    #[test]
    fn trim_is_idempotent() {
        let cfg = Config { embed_dim: 4, word_min_cnt: 2, ..Config::default() };
        let mut vocab = Vocab::new(&cfg);
        vocab.add_sentence("x x y y z");
        let first = vocab.trim();
        let i_fixed = vocab.fixed_count();
        let second = vocab.trim();
        assert_eq!(vocab.fixed_count(), i_fixed);
        assert_eq!(first.dim(), second.dim());
        assert_eq!(vocab.word_id("x"), 4);
        assert_eq!(vocab.word_id("y"), 5);
    }

    #[test]
    fn max_vocab_caps_fixed_segment() {
        let cfg = Config { embed_dim: 4, word_min_cnt: 1, max_vocab: 5, ..Config::default() };
        let mut vocab = Vocab::new(&cfg);
        vocab.add_sentence("one two three four");
        vocab.trim();
        // 4 reserved + 1 corpus word survive the cap.
        assert_eq!(vocab.fixed_count(), 5);
        assert_eq!(vocab.word_id("one"), 4);
        assert_eq!(vocab.word_id("two"), UNK_IDX);
    }

    #[test]
    fn id_word_roundtrip() {
        let mut vocab = Vocab::new(&small_cfg());
        vocab.add_sentence("a b c d e");
        vocab.trim();
        for i_id in 0..vocab.fixed_count() {
            let s_tok = vocab.id_word(i_id).to_string();
            assert_eq!(vocab.word_id(&s_tok), i_id);
        }
    }

    #[test]
    #[should_panic]
    fn id_word_out_of_range_panics() {
        let vocab = Vocab::new(&small_cfg());
        vocab.id_word(999);
    }

    #[test]
    fn dynamic_segment_is_batch_scoped() {
        let mut vocab = Vocab::new(&small_cfg());
        vocab.add_sentence("a b");
        vocab.trim();
        let i_fixed = vocab.fixed_count();

        vocab.begin_batch();
        let i_dyn = vocab.add_dynamic("oov-word");
        assert_eq!(i_dyn, i_fixed);
        assert_eq!(vocab.total_count(), i_fixed + 1);
        assert_eq!(vocab.word_id("oov-word"), i_dyn);

        vocab.end_batch();
        assert_eq!(vocab.total_count(), i_fixed);
        assert_eq!(vocab.word_id("oov-word"), UNK_IDX);

        // Next batch starts from a clean slate.
        vocab.begin_batch();
        assert_eq!(vocab.add_dynamic("another"), i_fixed);
    }

    #[test]
    fn add_dynamic_reuses_fixed_ids() {
        let mut vocab = Vocab::new(&small_cfg());
        vocab.add_sentence("a b");
        vocab.trim();
        vocab.begin_batch();
        assert_eq!(vocab.add_dynamic("a"), vocab.word_id("a"));
        assert_eq!(vocab.total_count(), vocab.fixed_count());
    }

    #[test]
    fn user_product_registries() {
        let mut vocab = Vocab::new(&small_cfg());
        vocab.add_user("u1");
        vocab.add_user("u2");
        vocab.add_user("u1");
        vocab.add_product("p1");
        assert_eq!(vocab.user_id("u1"), 1);
        assert_eq!(vocab.user_id("u2"), 2);
        assert_eq!(vocab.user_id("nobody"), 0);
        assert_eq!(vocab.product_id("p1"), 1);
        assert_eq!(vocab.product_id("unknown"), 0);
        assert_eq!(vocab.user_count(), 3);
        assert_eq!(vocab.product_count(), 2);
    }

    #[test]
    fn pretrained_words_enter_sorted_with_zero_count() {
        let mut pretrained = BTreeMap::new();
        pretrained.insert("beta".to_string(), vec![0.5; 8]);
        pretrained.insert("alpha".to_string(), vec![0.25; 8]);
        let cfg = Config { embed_dim: 8, word_min_cnt: 1, ..Config::default() };
        let mut vocab = Vocab::with_pretrained(&cfg, &pretrained);
        assert_eq!(vocab.word_id("alpha"), 4);
        assert_eq!(vocab.word_id("beta"), 5);
        // Never seen in the corpus, so min_cnt=1 prunes them.
        vocab.trim();
        assert_eq!(vocab.word_id("alpha"), UNK_IDX);
    }
}
