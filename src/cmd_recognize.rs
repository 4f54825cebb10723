use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io::{self, BufRead};

use argh::FromArgs;
use smol_str::SmolStr;

use hearsay::graph::{sentences_to_graph, GraphOptions};
use hearsay::{recognize, Recognition, RecognizeOptions};

use crate::cmd_compile::load_sentences;

#[derive(FromArgs)]
/// Recognize intents from stdin lines, one JSON result per line
#[argh(subcommand, name = "recognize")]
pub struct Recognize {
    /// sentences ini file (may repeat)
    #[argh(option, short = 's')]
    sentences: Vec<OsString>,

    /// casing applied to grammar and input words: keep, lower, or upper
    #[argh(option, default = "String::from(\"keep\")")]
    casing: String,

    /// require exact matches instead of fuzzy search
    #[argh(switch)]
    strict: bool,

    /// file with stop words, one per line
    #[argh(option)]
    stop_words: Option<OsString>,
}

impl Recognize {
    pub fn run(self) -> Result<(), String> {
        let (sentences, replacements) = load_sentences(&self.sentences, &self.casing)?;
        let graph = sentences_to_graph(&sentences, &replacements, &GraphOptions::default())
            .map_err(|err| err.to_string())?;

        let stop_words: HashSet<SmolStr> = match &self.stop_words {
            Some(path) => fs::read_to_string(path)
                .map_err(|err| format!("{}: {err}", path.to_string_lossy()))?
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(SmolStr::new)
                .collect(),
            None => HashSet::new(),
        };

        let lower = |s: &str| s.to_lowercase();
        let upper = |s: &str| s.to_uppercase();
        let word_transform: Option<&dyn Fn(&str) -> String> = match self.casing.as_str() {
            "lower" => Some(&lower),
            "upper" => Some(&upper),
            _ => None,
        };

        let options = RecognizeOptions {
            fuzzy: !self.strict,
            stop_words,
            word_transform,
            ..RecognizeOptions::default()
        };

        for line in io::stdin().lock().lines() {
            let line = line.map_err(|err| err.to_string())?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let results = recognize(line, &graph, &options);
            let result = results.into_iter().next().unwrap_or_else(Recognition::empty);
            let json = serde_json::to_string(&result).map_err(|err| err.to_string())?;
            println!("{json}");
        }

        Ok(())
    }
}
