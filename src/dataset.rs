// dataset.rs
// ============================================================================
// Note:  CSV corpus loader. One record per review: review text, summary
//        text, user id, product id. Text fields are expected pre-tokenized
//        (whitespace-separated); this loader does not normalize or split.
// ============================================================================

#![forbid(unsafe_code)]

use anyhow::{Context, Result, ensure};
use csv::ReaderBuilder;
use std::fs::File;

use crate::batch::Example;

/// Read a corpus file, one `review,summary,user,product` record per line,
/// no header row. Records missing fields are a data error, not something to
/// silently skip.
pub fn load_examples(s_path: &str) -> Result<Vec<Example>> {
    let file = File::open(s_path)
        .with_context(|| format!("cannot open corpus file {}", s_path))?;
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .flexible(false)
        .from_reader(file);

    let mut v_examples: Vec<Example> = Vec::new();
    for (i_line, record) in rdr.records().enumerate() {
        let record = record.with_context(|| format!("malformed CSV record {}", i_line))?;
        ensure!(
            record.len() == 4,
            "record {} has {} fields, expected review,summary,user,product",
            i_line,
            record.len()
        );
        let example = Example {
            review: record[0].to_string(),
            summary: record[1].to_string(),
            user: record[2].to_string(),
            product: record[3].to_string(),
            memory: Vec::new(),
        };
        ensure!(
            !example.review.trim().is_empty(),
            "record {} has an empty review",
            i_line
        );
        v_examples.push(example);
    }
    println!("Loaded {} examples from {}", v_examples.len(), s_path);
    Ok(v_examples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(s_name: &str, s_content: &str) -> String {
        let path = std::env::temp_dir().join(s_name);
        let mut f = File::create(&path).unwrap();
        f.write_all(s_content.as_bytes()).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn loads_records_in_order() {
        let s_path = write_temp(
            "copysum_dataset_ok.csv",
            "great case,sturdy,u1,p1\nbroke fast,bad,u2,p1\n",
        );
        let v = load_examples(&s_path).unwrap();
        assert_eq!(v.len(), 2);
        assert_eq!(v[0].review, "great case");
        assert_eq!(v[0].summary, "sturdy");
        assert_eq!(v[1].user, "u2");
        assert_eq!(v[1].product, "p1");
        assert!(v[0].memory.is_empty());
        let _ = std::fs::remove_file(&s_path);
    }

    #[test]
    fn wrong_field_count_is_an_error() {
        let s_path = write_temp("copysum_dataset_bad.csv", "only,three,fields\n");
        assert!(load_examples(&s_path).is_err());
        let _ = std::fs::remove_file(&s_path);
    }

    #[test]
    fn empty_review_is_an_error() {
        let s_path = write_temp("copysum_dataset_empty.csv", " ,summary,u1,p1\n");
        assert!(load_examples(&s_path).is_err());
        let _ = std::fs::remove_file(&s_path);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_examples("/nonexistent/copysum.csv").is_err());
    }
}
