//! Grammar AST for sentence templates.
//!
//! A template like `set a timer for (ten:10){minutes}` parses into a tree of
//! [`Expression`] values: literal [`Word`]s, ordered or branching
//! [`Sequence`]s, and references to named rules and slots that are resolved
//! through a replacements table at compile time.
//!
//! Each variant keeps the source fragment that produced it in `text`; that
//! field exists for diagnostics only and is ignored by structural equality.
//! A [`Tag`] marks the span of a named entity and may carry its own
//! substitution and converters, independent of the node it is attached to.

use std::collections::HashSet;

use log::debug;
use smol_str::SmolStr;

use crate::error::CompileError;
use crate::ini::Replacements;

/// Hard ceiling on reference expansion depth. Rules are expanded by value,
/// so hitting this means the definitions are recursive.
pub const MAX_EXPANSION_DEPTH: usize = 128;

/// `{tag}` attached to an expression. Delimits a named entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tag {
    /// Name of the tag (entity).
    pub tag_text: SmolStr,

    /// Replacement text emitted in place of the tagged subtree's output.
    pub substitution: Option<SmolStr>,

    /// Converters applied to the tagged region after matching.
    pub converters: Vec<SmolStr>,
}

impl Tag {
    pub fn new(tag_text: impl Into<SmolStr>) -> Self {
        Tag { tag_text: tag_text.into(), ..Tag::default() }
    }
}

/// Whether a sequence's items run in order or branch.
///
/// Optionals are alternatives whose final item is an empty [`Word`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SequenceType {
    #[default]
    Group,
    Alternative,
}

/// Single word/token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Word {
    pub text: SmolStr,
    pub substitution: Option<SmolStr>,
    pub converters: Vec<SmolStr>,
    pub tag: Option<Tag>,
}

impl Word {
    pub fn new(text: impl Into<SmolStr>) -> Self {
        Word { text: text.into(), ..Word::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Ordered sequence of expressions. Covers groups, optionals, and
/// alternatives.
#[derive(Debug, Clone, Default)]
pub struct Sequence {
    /// Source fragment (diagnostics only; not compared).
    pub text: String,
    pub seq_type: SequenceType,
    pub items: Vec<Expression>,
    pub tag: Option<Tag>,
    pub substitution: Option<SmolStr>,
    pub converters: Vec<SmolStr>,
}

impl PartialEq for Sequence {
    fn eq(&self, other: &Self) -> bool {
        self.seq_type == other.seq_type
            && self.items == other.items
            && self.tag == other.tag
            && self.substitution == other.substitution
            && self.converters == other.converters
    }
}

impl Eq for Sequence {}

impl Sequence {
    pub fn group() -> Self {
        Sequence { seq_type: SequenceType::Group, ..Sequence::default() }
    }

    pub fn alternative() -> Self {
        Sequence { seq_type: SequenceType::Alternative, ..Sequence::default() }
    }
}

/// A complete sentence template: the top-level [`Sequence`] of an intent
/// line or a rule body.
pub type Sentence = Sequence;

/// Reference to a rule by `<name>` or `<grammar.name>`.
#[derive(Debug, Clone, Default)]
pub struct RuleReference {
    /// Source fragment (diagnostics only; not compared).
    pub text: String,
    pub rule_name: SmolStr,
    pub grammar_name: Option<SmolStr>,
    pub tag: Option<Tag>,
}

impl PartialEq for RuleReference {
    fn eq(&self, other: &Self) -> bool {
        self.rule_name == other.rule_name
            && self.grammar_name == other.grammar_name
            && self.tag == other.tag
    }
}

impl Eq for RuleReference {}

impl RuleReference {
    /// Replacement-table key: `<grammar.name>` when qualified, `<name>`
    /// otherwise.
    pub fn key(&self) -> SmolStr {
        match &self.grammar_name {
            Some(grammar) => SmolStr::new(format!("<{grammar}.{}>", self.rule_name)),
            None => SmolStr::new(format!("<{}>", self.rule_name)),
        }
    }
}

/// Reference to a slot by `$name`. Comma-joined arguments stay inside
/// `slot_name` and only participate in the replacement lookup.
#[derive(Debug, Clone, Default)]
pub struct SlotReference {
    /// Source fragment (diagnostics only; not compared).
    pub text: String,
    pub slot_name: SmolStr,
    pub substitution: Option<SmolStr>,
    pub converters: Vec<SmolStr>,
    pub tag: Option<Tag>,
}

impl PartialEq for SlotReference {
    fn eq(&self, other: &Self) -> bool {
        self.slot_name == other.slot_name
            && self.substitution == other.substitution
            && self.converters == other.converters
            && self.tag == other.tag
    }
}

impl Eq for SlotReference {}

impl SlotReference {
    /// Replacement-table key: `$name`.
    pub fn key(&self) -> SmolStr {
        SmolStr::new(format!("${}", self.slot_name))
    }
}

/// One node of a parsed sentence template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Word(Word),
    Sequence(Sequence),
    RuleRef(RuleReference),
    SlotRef(SlotReference),
}

impl Expression {
    /// Source fragment that produced this node.
    pub fn text(&self) -> &str {
        match self {
            Expression::Word(w) => w.text.as_str(),
            Expression::Sequence(s) => &s.text,
            Expression::RuleRef(r) => &r.text,
            Expression::SlotRef(s) => &s.text,
        }
    }

    pub fn tag(&self) -> Option<&Tag> {
        match self {
            Expression::Word(w) => w.tag.as_ref(),
            Expression::Sequence(s) => s.tag.as_ref(),
            Expression::RuleRef(r) => r.tag.as_ref(),
            Expression::SlotRef(s) => s.tag.as_ref(),
        }
    }

    /// Attach a tag, replacing any previous one.
    pub fn set_tag(&mut self, tag: Tag) {
        match self {
            Expression::Word(w) => w.tag = Some(tag),
            Expression::Sequence(s) => s.tag = Some(tag),
            Expression::RuleRef(r) => r.tag = Some(tag),
            Expression::SlotRef(s) => s.tag = Some(tag),
        }
    }

    /// Substitution, for the variants that can carry one. Rule references
    /// cannot.
    pub fn substitution(&self) -> Option<&SmolStr> {
        match self {
            Expression::Word(w) => w.substitution.as_ref(),
            Expression::Sequence(s) => s.substitution.as_ref(),
            Expression::SlotRef(s) => s.substitution.as_ref(),
            Expression::RuleRef(_) => None,
        }
    }

    pub fn converters(&self) -> &[SmolStr] {
        match self {
            Expression::Word(w) => &w.converters,
            Expression::Sequence(s) => &s.converters,
            Expression::SlotRef(s) => &s.converters,
            Expression::RuleRef(_) => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Source rendering
// ---------------------------------------------------------------------------

fn push_trailers(
    out: &mut String,
    substitution: Option<&SmolStr>,
    converters: &[SmolStr],
    tag: Option<&Tag>,
) {
    if let Some(sub) = substitution {
        out.push(':');
        out.push_str(sub);
    }
    for conv in converters {
        out.push('!');
        out.push_str(conv);
    }
    if let Some(tag) = tag {
        out.push('{');
        out.push_str(&tag.tag_text);
        if let Some(sub) = &tag.substitution {
            out.push(':');
            out.push_str(sub);
        }
        for conv in &tag.converters {
            out.push('!');
            out.push_str(conv);
        }
        out.push('}');
    }
}

impl Sequence {
    /// True when this alternative came from an optional: its last branch is
    /// the empty word.
    fn is_optional(&self) -> bool {
        self.seq_type == SequenceType::Alternative
            && matches!(self.items.last(), Some(Expression::Word(w)) if w.is_empty())
    }

    fn render(&self, out: &mut String, top_level: bool) {
        let bare = top_level
            && self.tag.is_none()
            && self.substitution.is_none()
            && self.converters.is_empty();

        match self.seq_type {
            SequenceType::Group => {
                if !bare {
                    out.push('(');
                }
                join_items(out, &self.items, " ");
                if !bare {
                    out.push(')');
                }
            }
            SequenceType::Alternative if self.is_optional() => {
                out.push('[');
                join_items(out, &self.items[..self.items.len() - 1], " | ");
                out.push(']');
            }
            SequenceType::Alternative => {
                if !bare {
                    out.push('(');
                }
                join_items(out, &self.items, " | ");
                if !bare {
                    out.push(')');
                }
            }
        }

        push_trailers(out, self.substitution.as_ref(), &self.converters, self.tag.as_ref());
    }

    /// Render back to template syntax. Re-parsing the result yields a
    /// structurally equal sentence (modulo the sentence-unwrap rule).
    pub fn to_template(&self) -> String {
        let mut out = String::new();
        self.render(&mut out, true);
        out
    }
}

fn join_items(out: &mut String, items: &[Expression], sep: &str) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(sep);
        }
        out.push_str(&item.to_string());
    }
}

impl std::fmt::Display for Word {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = String::new();
        out.push_str(&self.text);
        push_trailers(&mut out, self.substitution.as_ref(), &self.converters, self.tag.as_ref());
        write!(f, "{out}")
    }
}

impl std::fmt::Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expression::Word(w) => write!(f, "{w}"),
            Expression::Sequence(s) => {
                let mut out = String::new();
                s.render(&mut out, false);
                write!(f, "{out}")
            }
            Expression::RuleRef(r) => {
                let mut out = String::new();
                match &r.grammar_name {
                    Some(grammar) => out.push_str(&format!("<{grammar}.{}>", r.rule_name)),
                    None => out.push_str(&format!("<{}>", r.rule_name)),
                }
                push_trailers(&mut out, None, &[], r.tag.as_ref());
                write!(f, "{out}")
            }
            Expression::SlotRef(s) => {
                let mut out = String::new();
                out.push('$');
                out.push_str(&s.slot_name);
                push_trailers(&mut out, s.substitution.as_ref(), &s.converters, s.tag.as_ref());
                write!(f, "{out}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Expansion counting
// ---------------------------------------------------------------------------

/// Number of distinct sentences an expression expands to.
///
/// Groups multiply, alternatives sum, references sum over their resolved
/// bodies. With `exclude_slots` set, slot references contribute zero.
/// `grammar_name` scopes unqualified rule references.
pub fn expression_count(
    expression: &Expression,
    replacements: &Replacements,
    grammar_name: Option<&str>,
    exclude_slots: bool,
) -> Result<u64, CompileError> {
    count_expr(expression, replacements, grammar_name, exclude_slots, 0)
}

/// [`expression_count`] over a whole sentence.
pub fn sentence_count(
    sentence: &Sentence,
    replacements: &Replacements,
    grammar_name: Option<&str>,
    exclude_slots: bool,
) -> Result<u64, CompileError> {
    count_seq(sentence, replacements, grammar_name, exclude_slots, 0)
}

fn count_seq(
    seq: &Sequence,
    replacements: &Replacements,
    grammar_name: Option<&str>,
    exclude_slots: bool,
    depth: usize,
) -> Result<u64, CompileError> {
    match seq.seq_type {
        SequenceType::Group => {
            let mut count: u64 = 1;
            for item in &seq.items {
                count = count
                    .saturating_mul(count_expr(item, replacements, grammar_name, exclude_slots, depth)?);
            }
            Ok(count)
        }
        SequenceType::Alternative => {
            let mut count: u64 = 0;
            for item in &seq.items {
                count = count
                    .saturating_add(count_expr(item, replacements, grammar_name, exclude_slots, depth)?);
            }
            Ok(count)
        }
    }
}

fn count_expr(
    expression: &Expression,
    replacements: &Replacements,
    grammar_name: Option<&str>,
    exclude_slots: bool,
    depth: usize,
) -> Result<u64, CompileError> {
    match expression {
        Expression::Word(_) => Ok(1),
        Expression::Sequence(seq) => count_seq(seq, replacements, grammar_name, exclude_slots, depth),
        Expression::RuleRef(rule_ref) => {
            let key = resolve_rule_key(rule_ref, grammar_name, replacements)
                .ok_or_else(|| CompileError::Resolve { name: rule_ref.key().to_string() })?;
            if depth >= MAX_EXPANSION_DEPTH {
                return Err(CompileError::Recursion { name: key.to_string() });
            }

            let mut count: u64 = 0;
            for body in &replacements[&key] {
                count = count
                    .saturating_add(count_seq(body, replacements, grammar_name, exclude_slots, depth + 1)?);
            }
            Ok(count)
        }
        Expression::SlotRef(slot_ref) => {
            if exclude_slots {
                return Ok(0);
            }

            let key = slot_ref.key();
            let values = replacements
                .get(&key)
                .ok_or_else(|| CompileError::Resolve { name: key.to_string() })?;
            if depth >= MAX_EXPANSION_DEPTH {
                return Err(CompileError::Recursion { name: key.to_string() });
            }

            let mut count: u64 = 0;
            for value in values {
                count = count
                    .saturating_add(count_seq(value, replacements, grammar_name, exclude_slots, depth + 1)?);
            }
            Ok(count)
        }
    }
}

/// Find the replacement key for a rule reference: the qualified
/// `<grammar.rule>` form wins over the bare `<rule>` form.
pub(crate) fn resolve_rule_key(
    rule_ref: &RuleReference,
    grammar_name: Option<&str>,
    replacements: &Replacements,
) -> Option<SmolStr> {
    if rule_ref.grammar_name.is_some() {
        let key = rule_ref.key();
        return replacements.contains_key(&key).then_some(key);
    }

    if let Some(grammar) = grammar_name {
        let qualified = SmolStr::new(format!("<{grammar}.{}>", rule_ref.rule_name));
        if replacements.contains_key(&qualified) {
            return Some(qualified);
        }
    }

    let bare = rule_ref.key();
    replacements.contains_key(&bare).then_some(bare)
}

// ---------------------------------------------------------------------------
// Visitor
// ---------------------------------------------------------------------------

/// What a [`walk_expression`] visitor wants done after seeing a node.
/// Replacement is done by mutating the node in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    SkipChildren,
}

/// Recursively visit every node of an expression, following rule and slot
/// references into the replacements table. Each table entry is visited at
/// most once per walk, so transforms reach referenced bodies exactly once
/// and reference cycles terminate.
pub fn walk_expression<F>(expression: &mut Expression, visit: &mut F, replacements: &mut Replacements)
where
    F: FnMut(&mut Expression) -> WalkControl,
{
    let mut seen = HashSet::new();
    walk_expr(expression, visit, replacements, &mut seen);
}

/// [`walk_expression`] over a whole sentence; the visitor sees the sentence
/// itself first.
pub fn walk_sentence<F>(sentence: &mut Sentence, visit: &mut F, replacements: &mut Replacements)
where
    F: FnMut(&mut Expression) -> WalkControl,
{
    let mut seen = HashSet::new();
    let owned = std::mem::take(sentence);
    *sentence = walk_owned_sentence(owned, visit, replacements, &mut seen);
}

fn walk_owned_sentence<F>(
    sentence: Sentence,
    visit: &mut F,
    replacements: &mut Replacements,
    seen: &mut HashSet<SmolStr>,
) -> Sentence
where
    F: FnMut(&mut Expression) -> WalkControl,
{
    let mut expr = Expression::Sequence(sentence);
    walk_expr(&mut expr, visit, replacements, seen);
    match expr {
        Expression::Sequence(seq) => seq,
        // The visitor replaced the root with something else; keep it as the
        // sole item of a fresh sentence.
        other => Sequence { items: vec![other], ..Sequence::default() },
    }
}

fn walk_expr<F>(
    expression: &mut Expression,
    visit: &mut F,
    replacements: &mut Replacements,
    seen: &mut HashSet<SmolStr>,
) where
    F: FnMut(&mut Expression) -> WalkControl,
{
    if visit(expression) == WalkControl::SkipChildren {
        return;
    }

    let key = match expression {
        Expression::Sequence(seq) => {
            for item in &mut seq.items {
                walk_expr(item, visit, replacements, seen);
            }
            return;
        }
        Expression::Word(_) => return,
        Expression::RuleRef(rule_ref) => rule_ref.key(),
        Expression::SlotRef(slot_ref) => slot_ref.key(),
    };

    if !seen.insert(key.clone()) {
        return;
    }

    // Detach the referenced bodies so they can be walked mutably, then put
    // them back under the same key.
    match replacements.remove(&key) {
        Some(bodies) => {
            let walked = bodies
                .into_iter()
                .map(|body| walk_owned_sentence(body, visit, replacements, seen))
                .collect();
            replacements.insert(key, walked);
        }
        None => debug!("no replacement for {key}; not descending"),
    }
}

/// Visitor that rewrites each word through `transform`, keeping the
/// original spelling as a substitution when the spelling changed. Used for
/// case folding before graph compilation.
pub fn word_case_visitor(
    transform: impl Fn(&str) -> String,
) -> impl FnMut(&mut Expression) -> WalkControl {
    move |expression| {
        if let Expression::Word(word) = expression {
            let new_text = transform(word.text.as_str());
            if word.substitution.is_none() && new_text != word.text.as_str() {
                word.substitution = Some(word.text.clone());
            }
            word.text = SmolStr::new(new_text);
        }
        WalkControl::Continue
    }
}
