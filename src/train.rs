// train.rs
// ============================================================================
// Note:  Epoch loop and greedy summarization. Batches are tensorized one at
//        a time so each one gets its own dynamic vocabulary segment; the
//        Ctrl+C flag is honored between batches, never inside a forward
//        pass. The summarize helper renders extended ids back to words while
//        the batch's dynamic segment is still alive, which is the only
//        window in which copied out-of-vocabulary words have a spelling.
// ============================================================================

// deny, not forbid: ndarray's s![] expands with its own unsafe-code allow.
#![deny(unsafe_code)]

use anyhow::Result;
use ndarray::s;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Instant;

use crate::batch::Example;
use crate::model::{DecodePolicy, Summarizer, argmax, nll_loss};
use crate::vocab::{EOS_IDX, Vocab};

/// Teacher-forced pass over the corpus for `cfg.epochs` epochs, reporting
/// average loss and throughput per epoch.
pub fn train(model: &Summarizer, vocab: &mut Vocab, corpus: &[Example]) -> Result<()> {
    let cfg = model.cfg.clone();

    let stop_flag = Arc::new(AtomicBool::new(false));
    {
        let stop_flag_ctrlc = Arc::clone(&stop_flag);
        let _ = ctrlc::set_handler(move || {
            stop_flag_ctrlc.store(true, AtomicOrdering::SeqCst);
        });
    }

    for i_epoch in 0..cfg.epochs {
        let t_epoch_start = Instant::now();
        let mut f_total_loss: f32 = 0.0;
        let mut i_batches: usize = 0;
        let mut i_tokens_epoch: usize = 0;

        for batch in corpus.chunks(cfg.batch_size) {
            if stop_flag.load(AtomicOrdering::Relaxed) {
                println!("Training interrupted (Ctrl+C)");
                return Ok(());
            }

            let t = vocab.read_batch(batch);
            let probs = model.forward(&t, DecodePolicy::TeacherForced);
            f_total_loss += nll_loss(&probs, &t.trg)?;
            i_batches += 1;
            i_tokens_epoch += t.trg_lens.iter().sum::<usize>();
        }

        let secs = t_epoch_start.elapsed().as_secs_f32().max(1e-6);
        let f_avg_loss = if i_batches > 0 { f_total_loss / i_batches as f32 } else { 0.0 };
        let tps = i_tokens_epoch as f32 / secs;
        println!(
            "Epoch {}  Loss {:.4}  Tokens/s {:.0}  (Tokens: {}, Duration: {:.2}s)",
            i_epoch, f_avg_loss, tps, i_tokens_epoch, secs
        );

        if stop_flag.load(AtomicOrdering::Relaxed) {
            println!("Training interrupted after epoch {}", i_epoch);
            return Ok(());
        }
    }
    Ok(())
}

/// Greedy-decode one example and render the emitted ids as text. Extended
/// ids resolve through the example's own dynamic segment, so copied
/// out-of-vocabulary words come back verbatim instead of as UNK.
pub fn summarize(model: &Summarizer, vocab: &mut Vocab, example: &Example) -> String {
    let t = vocab.read_batch(std::slice::from_ref(example));
    let probs = model.forward(&t, DecodePolicy::Greedy);

    let mut v_words: Vec<String> = Vec::new();
    for i_step in 0..probs.dim().1 {
        let row = probs.slice(s![0, i_step, ..]).to_owned();
        if row.sum() == 0.0 {
            break; // decoding terminated before this step
        }
        let i_id = argmax(&row);
        if i_id == EOS_IDX {
            break;
        }
        v_words.push(vocab.id_word(i_id).to_string());
    }
    v_words.join(" ")
}
