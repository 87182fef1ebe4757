// main.rs
// ============================================================================
// Note:  Demo binary. Wires the corpus loader, vocabulary build, model
//        construction, epoch loop and a few greedy sample summaries.
//        Usage: copysum [corpus.csv] [config.json] [checkpoint.bin]
// ============================================================================

#![forbid(unsafe_code)]

use anyhow::Result;
use std::path::Path;

use copysum::dataset::load_examples;
use copysum::train::{summarize, train};
use copysum::{Config, Summarizer, Vocab};

fn main() -> Result<()> {
    let v_args: Vec<String> = std::env::args().collect();
    let s_corpus = v_args.get(1).map(String::as_str).unwrap_or("data/reviews.csv");
    let s_config = v_args.get(2).map(String::as_str).unwrap_or("data/config.json");
    let s_checkpoint = v_args.get(3).map(String::as_str).unwrap_or("checkpoint.bin");

    let cfg = if Path::new(s_config).exists() {
        Config::load(s_config)?
    } else {
        println!("No config at {}, using defaults", s_config);
        Config::default()
    };

    let corpus = load_examples(s_corpus)?;

    // Corpus scan: both text sides feed the fixed vocabulary, attributes
    // feed their registries.
    let mut vocab = Vocab::new(&cfg);
    for ex in &corpus {
        vocab.add_sentence(&ex.review);
        vocab.add_sentence(&ex.summary);
        vocab.add_user(&ex.user);
        vocab.add_product(&ex.product);
    }
    let embed = vocab.trim();

    let model = if Path::new(s_checkpoint).exists() {
        match Summarizer::load(s_checkpoint, &vocab) {
            Ok(m) => {
                println!("Checkpoint loaded from {}", s_checkpoint);
                m
            }
            Err(e) => {
                eprintln!("Warning: cannot load checkpoint: {e}");
                Summarizer::new(&cfg, embed, vocab.user_count(), vocab.product_count())
            }
        }
    } else {
        Summarizer::new(&cfg, embed, vocab.user_count(), vocab.product_count())
    };

    println!("=== MODEL INFO ===");
    println!(
        "Configuration     : embed_dim={}, hidden_size={}, num_layers={}, attr_dim={}",
        cfg.embed_dim, cfg.hidden_size, cfg.num_layers, cfg.attr_dim
    );
    println!("Fixed vocabulary  : {}", vocab.fixed_count());
    println!("Users / products  : {} / {}", vocab.user_count(), vocab.product_count());
    println!("Total parameters  : {}", model.parameter_count());

    println!("Starting training ({} epochs) ...", cfg.epochs);
    train(&model, &mut vocab, &corpus)?;

    println!("=== SAMPLE SUMMARIES ===");
    for ex in corpus.iter().take(3) {
        let s_summary = summarize(&model, &mut vocab, ex);
        println!("Review  : {}", ex.review);
        println!("Gold    : {}", ex.summary);
        println!("Decoded : {}", s_summary);
    }

    model.save(s_checkpoint)?;
    println!("Checkpoint saved to {}", s_checkpoint);
    Ok(())
}
