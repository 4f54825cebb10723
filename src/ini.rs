//! INI container around sentence templates.
//!
//! Grammars arrive as INI-shaped text: `[Section]` opens an intent, a bare
//! line is a sentence template, and a `name = body` line defines a rule
//! local to that intent. This module splits the container into parsed
//! items, separates rules from sentences into the replacements table, and
//! renders intents back out to INI text.

use std::collections::{BTreeMap, HashMap};

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use smol_str::SmolStr;

use crate::error::CompileError;
use crate::expression::{sentence_count, Sentence};
use crate::parse::parse_sentence;

/// Parsed items grouped by intent name, in section order.
pub type Intents = BTreeMap<SmolStr, Vec<IntentItem>>;

/// Sentences grouped by intent name, after rules are split out.
pub type Sentences = BTreeMap<SmolStr, Vec<Sentence>>;

/// Replacement table: `<rule>` / `<Intent.rule>` / `$slot` keys to the
/// bodies they expand to.
pub type Replacements = HashMap<SmolStr, Vec<Sentence>>;

/// One line of an intent section: either a sentence template or a rule.
#[derive(Debug, Clone, PartialEq)]
pub enum IntentItem {
    Sentence(Sentence),
    Rule(Rule),
}

/// Named rule with a parsed body.
#[derive(Debug, Clone, Default)]
pub struct Rule {
    pub rule_name: SmolStr,
    pub rule_body: Sentence,
    pub public: bool,
    /// Source line (diagnostics only; not compared).
    pub text: String,
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.rule_name == other.rule_name
            && self.rule_body == other.rule_body
            && self.public == other.public
    }
}

static RULE_DEFINITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(public)?\s*<([^>]+)>\s*=\s*([^;]+)(;)?$").unwrap());

impl Rule {
    /// Parse a grammar-style rule definition:
    /// `public <RuleName> = rule body;` or `<RuleName> = rule body;`.
    pub fn parse(text: &str) -> Result<Rule, CompileError> {
        let captures = RULE_DEFINITION.captures(text).ok_or_else(|| CompileError::GrammarParse {
            line: 0,
            message: format!("not a rule definition: {text}"),
        })?;

        let public = captures.get(1).is_some();
        let rule_name = SmolStr::new(captures.get(2).map(|m| m.as_str()).unwrap_or(""));
        let rule_body = parse_sentence(captures.get(3).map(|m| m.as_str()).unwrap_or(""))?;

        Ok(Rule { rule_name, rule_body, public, text: text.to_string() })
    }
}

// ---------------------------------------------------------------------------
// INI splitting
// ---------------------------------------------------------------------------

/// Callbacks applied while splitting the INI container.
#[derive(Default)]
pub struct ParseOptions<'a> {
    /// Sections for which this returns false are dropped unparsed.
    pub intent_filter: Option<&'a dyn Fn(&str) -> bool>,
    /// Rewrite applied to every sentence/rule body before parsing
    /// (case folding and the like).
    pub sentence_transform: Option<&'a dyn Fn(&str) -> String>,
}

static SECTION_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[([^\]]+)\]$").unwrap());

/// Parse grammars for one or more intents from INI text.
pub fn parse_ini(source: &str) -> Result<Intents, CompileError> {
    parse_ini_with(source, &ParseOptions::default())
}

/// [`parse_ini`] with filter/transform callbacks.
pub fn parse_ini_with(source: &str, options: &ParseOptions<'_>) -> Result<Intents, CompileError> {
    let mut intents = Intents::new();
    let mut section: Option<SmolStr> = None;
    let mut skipping = false;

    for (line_index, raw_line) in source.lines().enumerate() {
        let line_number = line_index + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(header) = SECTION_HEADER.captures(line) {
            let name = header.get(1).map(|m| m.as_str()).unwrap_or("");
            skipping = match options.intent_filter {
                Some(filter) => !filter(name),
                None => false,
            };
            if skipping {
                debug!("skipping intent {name}");
                section = None;
            } else {
                section = Some(SmolStr::new(name));
            }
            continue;
        }

        if skipping {
            continue;
        }

        let Some(intent_name) = section.clone() else {
            return Err(CompileError::GrammarParse {
                line: line_number,
                message: format!("line outside of any [Intent] section: {line}"),
            });
        };

        // \[ lets a sentence begin with a literal bracket instead of a
        // section header.
        let unescaped = line.replace("\\[", "[");

        let item = if let Some((key, value)) = unescaped.split_once('=') {
            // Rule: name = body (angle brackets around the name optional)
            let key = key.trim().trim_start_matches('<').trim_end_matches('>').trim();
            let mut body = value.trim().to_string();
            if let Some(transform) = options.sentence_transform {
                body = transform(&body);
            }

            let rule_text = format!("<{key}> = ({body});");
            let rule = Rule::parse(&rule_text).map_err(|err| at_line(err, line_number))?;
            IntentItem::Rule(rule)
        } else {
            let mut body = unescaped;
            if let Some(transform) = options.sentence_transform {
                body = transform(&body);
            }

            let sentence = parse_sentence(&body).map_err(|err| at_line(err, line_number))?;
            IntentItem::Sentence(sentence)
        };

        intents.entry(intent_name).or_default().push(item);
    }

    Ok(intents)
}

fn at_line(err: CompileError, line: usize) -> CompileError {
    match err {
        CompileError::GrammarParse { message, .. } => CompileError::GrammarParse { line, message },
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Rule/slot resolution
// ---------------------------------------------------------------------------

/// Separate rules from sentences. Each rule body lands in the returned
/// replacements table under its qualified `<Intent.name>` key and, for
/// unqualified names, under the bare `<name>` key as well (later intents
/// shadow the bare entry).
pub fn split_rules(
    intents: &Intents,
    replacements: Replacements,
) -> (Sentences, Replacements) {
    let mut sentences = Sentences::new();
    let mut replacements = replacements;

    for (intent_name, items) in intents {
        let intent_sentences = sentences.entry(intent_name.clone()).or_default();

        for item in items {
            match item {
                IntentItem::Rule(rule) => {
                    let rule_name = rule.rule_name.as_str();
                    let qualified = if rule_name.contains('.') {
                        format!("<{rule_name}>")
                    } else {
                        replacements
                            .insert(SmolStr::new(format!("<{rule_name}>")), vec![rule.rule_body.clone()]);
                        format!("<{intent_name}.{rule_name}>")
                    };

                    replacements.insert(SmolStr::new(qualified), vec![rule.rule_body.clone()]);
                }
                IntentItem::Sentence(sentence) => intent_sentences.push(sentence.clone()),
            }
        }
    }

    (sentences, replacements)
}

/// Number of possible sentences per intent.
pub fn get_intent_counts(
    intents: &Intents,
    replacements: Replacements,
    exclude_slots: bool,
) -> Result<BTreeMap<SmolStr, u64>, CompileError> {
    let (sentences, replacements) = split_rules(intents, replacements);
    let mut intent_counts = BTreeMap::new();

    for (intent_name, intent_sentences) in &sentences {
        let mut count: u64 = 0;
        for sentence in intent_sentences {
            count = count.saturating_add(sentence_count(
                sentence,
                &replacements,
                Some(intent_name.as_str()),
                exclude_slots,
            )?);
        }
        intent_counts.insert(intent_name.clone(), count);
    }

    Ok(intent_counts)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Render intents back to INI text. Parsing the result yields intents
/// structurally equal to the originals.
pub fn intents_to_ini(intents: &Intents) -> String {
    let mut out = String::new();
    for (intent_name, items) in intents {
        out.push('[');
        out.push_str(intent_name);
        out.push_str("]\n");

        for item in items {
            match item {
                IntentItem::Sentence(sentence) => {
                    let line = sentence.to_template();
                    if line.starts_with('[') {
                        out.push('\\');
                    }
                    out.push_str(&line);
                    out.push('\n');
                }
                IntentItem::Rule(rule) => {
                    out.push_str(&rule.rule_name);
                    out.push_str(" = ");
                    out.push_str(&rule.rule_body.to_template());
                    out.push('\n');
                }
            }
        }

        out.push('\n');
    }
    out
}
