//! Single-pass character scanner for sentence templates.
//!
//! Consumes a template string like `turn [the] light (on | off){state}` and
//! produces the [`Sequence`] AST. The scanner threads an explicit index
//! through the character buffer; bracketed constructs recurse with the
//! matching closer as the end-of-expression set. A closer that never
//! arrives surfaces as `None`, which the caller reports as a parse failure
//! for the offending line.

use log::trace;
use smol_str::SmolStr;

use crate::error::CompileError;
use crate::expression::{
    Expression, RuleReference, Sentence, Sequence, SequenceType, SlotReference, Tag, Word,
};

/// Parse a complete sentence template.
pub fn parse_sentence(text: &str) -> Result<Sentence, CompileError> {
    let chars: Vec<char> = text.chars().collect();
    let mut root = Sequence { text: text.to_string(), ..Sequence::group() };

    parse_expression(Some(&mut root), &chars, &[], true).ok_or_else(|| CompileError::GrammarParse {
        line: 0,
        message: format!("malformed sentence template: {text}"),
    })?;

    unwrap_sequence(&mut root);
    Ok(root)
}

/// Recursively unpack a sequence whose sole item is another sequence: the
/// outer node adopts the inner type, items, tag, and substitution.
pub(crate) fn unwrap_sequence(seq: &mut Sequence) {
    while seq.items.len() == 1 && matches!(seq.items[0], Expression::Sequence(_)) {
        let Expression::Sequence(item) = seq.items.remove(0) else {
            unreachable!();
        };
        seq.seq_type = item.seq_type;
        if !item.text.is_empty() {
            seq.text = item.text;
        }
        seq.items = item.items;
        if item.tag.is_some() {
            seq.tag = item.tag;
        }
        if item.substitution.is_some() {
            seq.substitution = item.substitution;
        }
    }
}

// ---------------------------------------------------------------------------
// Literal tokens
// ---------------------------------------------------------------------------

/// Split off `!converter` suffixes: `ten:10!int!square` becomes
/// (`ten:10`, `[int, square]`).
fn split_converters(token: &str) -> (&str, Vec<SmolStr>) {
    if token.contains('!') {
        let mut parts = token.split('!');
        let text = parts.next().unwrap_or("");
        (text, parts.map(SmolStr::new).collect())
    } else {
        (token, Vec::new())
    }
}

/// Turn one whitespace-delimited token into an expression. Detects slot
/// references, substitutions, and converters.
fn token_to_expression(token: &str) -> Expression {
    if let Some(body) = token.strip_prefix('$') {
        let (body, converters) = split_converters(body);
        let (slot_name, substitution) = match body.split_once(':') {
            Some((name, sub)) => (name, Some(SmolStr::new(sub))),
            None => (body, None),
        };
        return Expression::SlotRef(SlotReference {
            text: token.to_string(),
            slot_name: SmolStr::new(slot_name),
            substitution,
            converters,
            tag: None,
        });
    }

    if token.contains(':') || token.contains('!') {
        let (text, converters) = split_converters(token);
        let (text, substitution) = match text.split_once(':') {
            Some((lhs, rhs)) => (lhs, Some(SmolStr::new(rhs))),
            None => (text, None),
        };
        return Expression::Word(Word {
            text: SmolStr::new(text),
            substitution,
            converters,
            tag: None,
        });
    }

    Expression::Word(Word::new(token))
}

fn split_words(literal: &str) -> Vec<Expression> {
    literal.split_whitespace().map(token_to_expression).collect()
}

// ---------------------------------------------------------------------------
// Scanner state
// ---------------------------------------------------------------------------

/// Accumulator for one expression scope. A plain run of items lives in
/// `items`; once a `|` is seen the scope becomes an alternative and
/// completed branches move into `branches`.
#[derive(Default)]
struct Acc {
    items: Vec<Expression>,
    branches: Vec<Expression>,
    is_alt: bool,
    /// Whether the most recent branch is a synthetic wrapper group, in
    /// which case tag/substitution attachment reaches inside it.
    last_branch_wrapped: bool,
}

impl Acc {
    fn push(&mut self, expr: Expression) {
        self.items.push(expr);
    }

    /// The expression a trailing `{tag}`, `:substitution`, or `!converter`
    /// attaches to. Immediately after a `|` this is still the last item of
    /// the previous branch.
    fn last_taggable_mut(&mut self) -> Option<&mut Expression> {
        if !self.items.is_empty() {
            return self.items.last_mut();
        }
        if !self.is_alt {
            return None;
        }
        match self.branches.last_mut() {
            Some(expr) => {
                if self.last_branch_wrapped {
                    if let Expression::Sequence(group) = expr {
                        return group.items.last_mut();
                    }
                }
                Some(expr)
            }
            None => None,
        }
    }

    fn close_branch(&mut self, unwrap_single: bool) {
        let items = std::mem::take(&mut self.items);
        if unwrap_single && items.len() == 1 {
            self.branches.push(items.into_iter().next().unwrap());
            self.last_branch_wrapped = false;
        } else {
            self.branches.push(Expression::Sequence(group_of(items)));
            self.last_branch_wrapped = true;
        }
    }
}

/// Wrap items into a group whose text is the joined item texts.
fn group_of(items: Vec<Expression>) -> Sequence {
    let text = items.iter().map(Expression::text).collect::<Vec<_>>().join(" ");
    Sequence { text, seq_type: SequenceType::Group, items, ..Sequence::default() }
}

fn parse_tag(raw: &str) -> Tag {
    let (raw, converters) = split_converters(raw);
    let (tag_text, substitution) = match raw.split_once(':') {
        Some((lhs, rhs)) => (lhs, Some(SmolStr::new(rhs))),
        None => (raw, None),
    };
    Tag { tag_text: SmolStr::new(tag_text), substitution, converters }
}

fn attach_substitution(expr: &mut Expression, substitution: SmolStr) -> Option<()> {
    match expr {
        Expression::Word(w) => w.substitution = Some(substitution),
        Expression::Sequence(s) => s.substitution = Some(substitution),
        Expression::SlotRef(s) => s.substitution = Some(substitution),
        // Rule references cannot carry substitutions.
        Expression::RuleRef(_) => return None,
    }
    Some(())
}

fn attach_converters(expr: &mut Expression, converters: Vec<SmolStr>) -> Option<()> {
    match expr {
        Expression::Word(w) => w.converters = converters,
        Expression::Sequence(s) => s.converters = converters,
        Expression::SlotRef(s) => s.converters = converters,
        Expression::RuleRef(_) => return None,
    }
    Some(())
}

// ---------------------------------------------------------------------------
// Main scan
// ---------------------------------------------------------------------------

/// Scan one expression. With `root` absent this only locates the end
/// character (used for substitutions, tags, and reference names).
///
/// Returns the scan position in the caller's convention: the caller
/// resumes at `opener_index + returned`, and the fragment between the
/// brackets is `chars[opener_index + 1 .. opener_index + returned - 1]`.
/// Returns `None` when a required end character never shows up or the
/// template is malformed.
pub(crate) fn parse_expression(
    root: Option<&mut Sequence>,
    chars: &[char],
    end: &[char],
    is_literal: bool,
) -> Option<usize> {
    let mut acc = Acc::default();
    let has_root = root.is_some();
    let mut literal = String::new();
    let mut found = false;
    let mut ret = chars.len() + 1;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        let last_c = if i > 0 { Some(chars[i - 1]) } else { None };

        if end.contains(&c) {
            found = true;
            ret = i + 2;
            break;
        }

        // Trailing substitution/converters on a just-closed sequence.
        if (c == ':' || c == '!') && matches!(last_c, Some(')') | Some(']')) {
            let mut sub_end = vec![' '];
            sub_end.extend_from_slice(end);
            let resume = match parse_expression(None, &chars[i + 1..], &sub_end, false) {
                Some(r) => r + i - 1,
                None => chars.len() + 1,
            };
            let raw: String =
                chars[i + 1..resume.min(chars.len())].iter().collect::<String>().trim().to_string();

            let target = acc.last_taggable_mut()?;
            if c == ':' {
                let (sub, converters) = split_converters(&raw);
                if !converters.is_empty() {
                    attach_converters(target, converters)?;
                }
                attach_substitution(target, SmolStr::new(sub))?;
            } else {
                let converters = raw.split('!').map(SmolStr::new).collect();
                attach_converters(target, converters)?;
            }

            i = resume;
            continue;
        }

        match c {
            '<' | '(' | '[' | '{' | '|' => {
                // Break the literal run before handling structure.
                let trimmed = literal.trim();
                if !trimmed.is_empty() {
                    if !has_root {
                        return None;
                    }
                    acc.items.extend(split_words(trimmed));
                }
                literal.clear();
            }
            _ => {
                literal.push(c);
                i += 1;
                continue;
            }
        }

        match c {
            '<' => {
                // Rule reference
                let r = parse_expression(None, &chars[i + 1..], &['>'], false)?;
                let next = r + i;
                let name: String = chars[i + 1..next - 1].iter().collect();
                let mut rule = RuleReference {
                    text: chars[i..next].iter().collect(),
                    ..RuleReference::default()
                };
                match name.rfind('.') {
                    Some(dot) => {
                        rule.grammar_name = Some(SmolStr::new(&name[..dot]));
                        rule.rule_name = SmolStr::new(&name[dot + 1..]);
                    }
                    None => rule.rule_name = SmolStr::new(&name),
                }
                if !has_root {
                    return None;
                }
                acc.push(Expression::RuleRef(rule));
                i = next;
            }
            '(' => {
                // Group
                let mut group = Sequence::group();
                let r = parse_expression(Some(&mut group), &chars[i + 1..], &[')'], true)?;
                let next = r + i;
                unwrap_sequence(&mut group);
                group.text = chars[i + 1..next - 1].iter().collect();
                if !has_root {
                    return None;
                }
                acc.push(Expression::Sequence(group));
                i = next;
            }
            '[' => {
                // Optional: an alternative between the body and nothing.
                let mut optional_seq = Sequence::group();
                let r = parse_expression(Some(&mut optional_seq), &chars[i + 1..], &[']'], true)?;
                let next = r + i;
                unwrap_sequence(&mut optional_seq);
                let fragment: String = chars[i + 1..next - 1].iter().collect();

                let mut optional = Sequence::alternative();
                let plain = optional_seq.tag.is_none() && optional_seq.substitution.is_none();
                if !optional_seq.items.is_empty() {
                    if optional_seq.items.len() == 1 && plain {
                        // Unpack the sole inner item
                        optional.items.push(optional_seq.items.pop().unwrap());
                    } else if optional_seq.seq_type == SequenceType::Alternative && plain {
                        // Splice an untagged inner alternative
                        optional.items.append(&mut optional_seq.items);
                    } else {
                        // Keep the inner body whole
                        optional_seq.text = fragment.clone();
                        optional.items.push(Expression::Sequence(optional_seq));
                    }
                }

                // Empty branch that makes the body optional
                optional.items.push(Expression::Word(Word::new("")));
                optional.text = fragment;
                if !has_root {
                    return None;
                }
                acc.push(Expression::Sequence(optional));
                i = next;
            }
            '{' => {
                // Tag on the preceding expression
                let r = parse_expression(None, &chars[i + 1..], &['}'], false)?;
                let next = r + i;
                let raw: String = chars[i + 1..next - 1].iter().collect();
                let tag = parse_tag(&raw);
                acc.last_taggable_mut()?.set_tag(tag);
                i = next;
            }
            '|' => {
                if !has_root {
                    return None;
                }
                if !acc.is_alt {
                    acc.is_alt = true;
                    acc.close_branch(true);
                } else {
                    acc.close_branch(false);
                }
                i += 1;
            }
            _ => unreachable!(),
        }
    }

    // End of expression: break the final literal run.
    let trimmed = literal.trim();
    if is_literal && !trimmed.is_empty() {
        if !has_root {
            return None;
        }
        acc.items.extend(split_words(trimmed));
    }

    if let Some(root) = root {
        if acc.is_alt {
            acc.close_branch(true);
            let alternative = Sequence {
                seq_type: SequenceType::Alternative,
                items: acc.branches,
                ..Sequence::default()
            };
            root.items.push(Expression::Sequence(alternative));
        } else {
            root.items.extend(acc.items);
            if root.text.is_empty() {
                root.text = root.items.iter().map(Expression::text).collect::<Vec<_>>().join(" ");
            }
        }
        trace!("parsed {} item(s) from {:?}", root.items.len(), root.text);
    }

    if !end.is_empty() && !found {
        // Never saw the closer
        return None;
    }

    Some(ret)
}
