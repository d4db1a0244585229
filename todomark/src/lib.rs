//! Todo items embedded in plain-text list documents.
//! The pipeline is layered leaves-first: a structural parse feeds list discovery, glyph
//! classification and metadata extraction, which together produce a `TodoMap` snapshot.
//! `engine` owns the documents and applies batched edits through transactions.

pub mod core {
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{fmt, path::PathBuf};
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct DocumentId(pub Uuid);

    impl DocumentId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl fmt::Display for DocumentId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            self.0.fmt(f)
        }
    }

    /// Stable todo identifier. Bound to a document mark, so it survives edits that move the row.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TodoId(pub Uuid);

    impl TodoId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl fmt::Display for TodoId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            self.0.fmt(f)
        }
    }

    /// Index of a node inside a `syntax::SyntaxTree` arena.
    #[derive(
        Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    )]
    #[serde(transparent)]
    pub struct NodeId(pub usize);

    /* ---------------------------- Positions ---------------------------- */

    /// 0-based row and byte column.
    #[derive(
        Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    )]
    pub struct Position {
        pub row: usize,
        pub col: usize,
    }

    impl Position {
        pub fn new(row: usize, col: usize) -> Self {
            Self { row, col }
        }
    }

    /// End-exclusive span of positions.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Range {
        pub start: Position,
        pub end: Position,
    }

    impl Range {
        pub fn new(start: Position, end: Position) -> Self {
            Self { start, end }
        }

        pub fn on_row(row: usize, start_col: usize, end_col: usize) -> Self {
            Self::new(Position::new(row, start_col), Position::new(row, end_col))
        }

        pub fn contains(&self, pos: Position) -> bool {
            pos >= self.start && pos < self.end
        }

        pub fn contains_row(&self, row: usize) -> bool {
            row >= self.start.row && row <= self.end.row
        }
    }

    /* ------------------------------ Lists ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum ListMarkerKind {
        Ordered,
        Unordered,
    }

    /// The list bullet of an item, e.g. `-`, `*`, `+`, `1.` or `2)`.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ListMarker {
        pub kind: ListMarkerKind,
        pub text: String,
    }

    impl ListMarker {
        pub fn from_token(text: &str) -> Self {
            let kind = if text.ends_with(['.', ')']) {
                ListMarkerKind::Ordered
            } else {
                ListMarkerKind::Unordered
            };
            Self {
                kind,
                text: text.to_string(),
            }
        }
    }

    /// Any structural list entry, todo or not. Rebuilt on every discovery pass.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ListItem {
        pub node: NodeId,
        pub range: Range,
        pub parent: Option<NodeId>,
        pub children: Vec<NodeId>,
        pub list_marker: ListMarker,
        pub marker_range: Range,
    }

    /* ------------------------------ Todos ------------------------------ */

    /// The state glyph of a todo and where it sits in the buffer.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TodoMarker {
        pub text: String,
        pub position: Position,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TodoItem {
        pub id: TodoId,
        /// Configured state name (`unchecked`, `checked`, or a custom state).
        pub state: String,
        /// Whole item including nested content; `end.col` is the length of the last covered line.
        pub range: Range,
        pub marker: TodoMarker,
        pub list_marker: ListMarker,
        pub parent_id: Option<TodoId>,
        #[serde(default)]
        pub children: Vec<TodoId>,
        /// First-line content after the glyph.
        pub text: String,
        /// Span scanned for metadata: rest of the first line plus paragraph continuation lines.
        pub first_inline_range: Range,
        #[serde(default)]
        pub metadata: MetadataSet,
        #[serde(skip_serializing, skip_deserializing)]
        pub node: NodeId,
    }

    impl TodoItem {
        /// Row-oriented containment: the marker row counts from column 0, and the last row up
        /// to and including its end column.
        pub fn covers(&self, pos: Position) -> bool {
            self.range.contains_row(pos.row)
                && (pos.row < self.range.end.row || pos.col <= self.range.end.col)
        }
    }

    /* ----------------------------- Metadata ----------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MetadataEntry {
        /// Tag as written, possibly an alias.
        pub tag: String,
        /// Canonical tag name when `tag` is an alias.
        pub alias_for: Option<String>,
        pub value: String,
        /// `@tag(value)` span.
        pub range: Range,
        /// Inner span; `end` is the closing paren.
        pub value_range: Range,
    }

    impl MetadataEntry {
        pub fn canonical_tag(&self) -> &str {
            self.alias_for.as_deref().unwrap_or(&self.tag)
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MetadataSet {
        /// Source order.
        pub entries: Vec<MetadataEntry>,
        /// Keyed by the tag as written; the last occurrence wins.
        pub by_tag: IndexMap<String, MetadataEntry>,
    }

    impl MetadataSet {
        pub fn push(&mut self, entry: MetadataEntry) {
            self.by_tag.insert(entry.tag.clone(), entry.clone());
            self.entries.push(entry);
        }

        pub fn get(&self, tag: &str) -> Option<&MetadataEntry> {
            self.by_tag.get(tag)
        }

        /// Last entry written as `canonical` or any of its aliases.
        pub fn get_canonical(&self, canonical: &str) -> Option<&MetadataEntry> {
            self.entries
                .iter()
                .rev()
                .find(|entry| entry.canonical_tag() == canonical)
        }

        pub fn len(&self) -> usize {
            self.entries.len()
        }

        pub fn is_empty(&self) -> bool {
            self.entries.is_empty()
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("missing required todo state `{0}`")]
        MissingState(String),
        #[error("todo state `{state}` has an invalid marker {marker:?}")]
        InvalidMarker { state: String, marker: String },
        #[error("marker {marker:?} is used by both `{first}` and `{second}`")]
        DuplicateMarker {
            marker: String,
            first: String,
            second: String,
        },
        #[error("todo state `{state}` has an invalid markdown character {ch:?}")]
        InvalidMarkdown { state: String, ch: char },
        #[error("markdown character {ch:?} is used by both `{first}` and `{second}`")]
        DuplicateMarkdown {
            ch: char,
            first: String,
            second: String,
        },
        #[error("invalid metadata tag name `{0}`")]
        InvalidTagName(String),
        #[error("metadata name `{0}` is declared more than once")]
        DuplicateTag(String),
        #[error("invalid default list marker {0:?}")]
        InvalidListMarker(String),
        #[error("reading config {path:?}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("parsing config")]
        Parse(#[from] serde_json::Error),
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum PatchError {
        #[error(
            "hunks overlap: rows {first_start}..{first_end} and {second_start}..{second_end}"
        )]
        Conflict {
            first_start: usize,
            first_end: usize,
            second_start: usize,
            second_end: usize,
        },
        #[error("hunk rows {start}..{end} exceed document length {len}")]
        OutOfBounds { start: usize, end: usize, len: usize },
        #[error("hunk start row {start} is after its end row {end}")]
        Inverted { start: usize, end: usize },
    }

    #[derive(Debug, thiserror::Error)]
    pub enum EngineError {
        #[error("unknown document {0}")]
        UnknownDocument(DocumentId),
        #[error("a transaction is already active for document `{name}` ({document})")]
        Reentrancy { document: DocumentId, name: String },
        #[error("unknown todo {0}")]
        UnknownTodo(TodoId),
        #[error("no todo at row {row}")]
        NoTodoAt { row: usize },
        #[error("unknown todo state `{0}`")]
        UnknownState(String),
        #[error("transaction body failed: {0}")]
        Body(String),
        #[error(transparent)]
        Patch(#[from] PatchError),
        #[error(transparent)]
        Config(#[from] ConfigError),
        #[error("accessing {path:?}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
    }
}

pub mod config {
    //! Host-supplied configuration: state glyphs, metadata tags and list preferences.
    //!
    //! Loading merges the two required states (`unchecked`, `checked`) from the defaults when a
    //! file only declares custom states. Everything else is taken as written and then validated.

    use crate::core::{ConfigError, ListMarker};
    use crate::syntax::list_item_start;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{
        collections::{HashMap, HashSet},
        fs,
        path::Path,
    };

    pub const UNCHECKED: &str = "unchecked";
    pub const CHECKED: &str = "checked";

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Config {
        /// State name → glyph definition. Order is significant for display only.
        pub todo_states: IndexMap<String, TodoStateConfig>,
        /// Canonical tag name → tag definition.
        pub metadata: IndexMap<String, MetadataTagConfig>,
        pub list_style: ListStyle,
        pub smart_toggle: SmartToggle,
        /// `chrono` format used for `date` metadata defaults.
        pub date_format: String,
        /// `chrono` format used for `datetime` metadata defaults.
        pub datetime_format: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TodoStateConfig {
        /// Canonical glyph, e.g. `☐`. May be more than one character.
        pub marker: String,
        /// Character inside the portable `[ ]` checkbox.
        pub markdown: char,
        #[serde(default = "StateKind::incomplete")]
        pub kind: StateKind,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum StateKind {
        Incomplete,
        Complete,
        Inactive,
    }

    impl StateKind {
        fn incomplete() -> Self {
            StateKind::Incomplete
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct MetadataTagConfig {
        pub aliases: Vec<String>,
        /// Value used when the tag is added without one.
        pub default: MetadataDefault,
        /// Static value choices offered to pickers.
        pub choices: Vec<String>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "kind", content = "value", rename_all = "lowercase")]
    pub enum MetadataDefault {
        #[default]
        Empty,
        Date,
        DateTime,
        Text(String),
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ListStyle {
        /// Bullet used when a plain line is turned into a todo.
        pub default_marker: String,
    }

    impl Default for ListStyle {
        fn default() -> Self {
            Self {
                default_marker: "-".into(),
            }
        }
    }

    /// Parent/child propagation when toggling through `TodoEngine::toggle`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct SmartToggle {
        pub enabled: bool,
        /// Completing an item completes its incomplete descendants.
        pub check_down: bool,
        /// A parent whose children are all complete is completed.
        pub check_up: bool,
        /// Reopening a child reopens a completed parent.
        pub uncheck_up: bool,
    }

    impl Default for SmartToggle {
        fn default() -> Self {
            Self {
                enabled: true,
                check_down: true,
                check_up: true,
                uncheck_up: true,
            }
        }
    }

    impl Default for Config {
        fn default() -> Self {
            let mut todo_states = IndexMap::new();
            todo_states.insert(
                UNCHECKED.to_string(),
                TodoStateConfig {
                    marker: "☐".into(),
                    markdown: ' ',
                    kind: StateKind::Incomplete,
                },
            );
            todo_states.insert(
                CHECKED.to_string(),
                TodoStateConfig {
                    marker: "✔".into(),
                    markdown: 'x',
                    kind: StateKind::Complete,
                },
            );

            let mut metadata = IndexMap::new();
            metadata.insert(
                "started".to_string(),
                MetadataTagConfig {
                    aliases: vec!["init".into()],
                    default: MetadataDefault::Date,
                    choices: vec![],
                },
            );
            metadata.insert(
                "done".to_string(),
                MetadataTagConfig {
                    aliases: vec!["completed".into(), "finished".into()],
                    default: MetadataDefault::Date,
                    choices: vec![],
                },
            );
            metadata.insert(
                "priority".to_string(),
                MetadataTagConfig {
                    aliases: vec![],
                    default: MetadataDefault::Text("medium".into()),
                    choices: vec!["low".into(), "medium".into(), "high".into()],
                },
            );

            Self {
                todo_states,
                metadata,
                list_style: ListStyle::default(),
                smart_toggle: SmartToggle::default(),
                date_format: "%Y-%m-%d".into(),
                datetime_format: "%Y-%m-%d %H:%M".into(),
            }
        }
    }

    impl Config {
        /// Read and validate a JSON config file.
        pub fn load(path: &Path) -> Result<Self, ConfigError> {
            let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            Self::from_json_str(&text)
        }

        pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
            let mut config: Config = serde_json::from_str(text)?;
            config.fill_required_states();
            config.validate()?;
            Ok(config)
        }

        fn fill_required_states(&mut self) {
            let defaults = Config::default();
            for (offset, name) in [UNCHECKED, CHECKED].into_iter().enumerate() {
                if self.todo_states.contains_key(name) {
                    continue;
                }
                if let Some(state) = defaults.todo_states.get(name) {
                    self.todo_states.shift_insert(
                        offset.min(self.todo_states.len()),
                        name.to_string(),
                        state.clone(),
                    );
                }
            }
        }

        pub fn validate(&self) -> Result<(), ConfigError> {
            for required in [UNCHECKED, CHECKED] {
                if !self.todo_states.contains_key(required) {
                    return Err(ConfigError::MissingState(required.into()));
                }
            }

            let mut markers: HashMap<&str, &str> = HashMap::new();
            let mut markdown: HashMap<char, &str> = HashMap::new();
            for (name, state) in &self.todo_states {
                if state.marker.is_empty() || state.marker.chars().any(char::is_whitespace) {
                    return Err(ConfigError::InvalidMarker {
                        state: name.clone(),
                        marker: state.marker.clone(),
                    });
                }
                if let Some(first) = markers.insert(state.marker.as_str(), name.as_str()) {
                    return Err(ConfigError::DuplicateMarker {
                        marker: state.marker.clone(),
                        first: first.into(),
                        second: name.clone(),
                    });
                }

                let ch = state.markdown;
                let blank_allowed = ch == ' ' && name == UNCHECKED;
                if matches!(ch, '[' | ']' | '\n' | '\r') || (ch.is_whitespace() && !blank_allowed) {
                    return Err(ConfigError::InvalidMarkdown {
                        state: name.clone(),
                        ch,
                    });
                }
                if let Some(first) = markdown.insert(ch.to_ascii_lowercase(), name.as_str()) {
                    return Err(ConfigError::DuplicateMarkdown {
                        ch,
                        first: first.into(),
                        second: name.clone(),
                    });
                }
            }

            let mut tag_names: HashSet<&str> = HashSet::new();
            for (name, tag) in &self.metadata {
                for candidate in std::iter::once(name).chain(tag.aliases.iter()) {
                    if !is_valid_tag_name(candidate) {
                        return Err(ConfigError::InvalidTagName(candidate.clone()));
                    }
                    if !tag_names.insert(candidate.as_str()) {
                        return Err(ConfigError::DuplicateTag(candidate.clone()));
                    }
                }
            }

            let marker = &self.list_style.default_marker;
            match list_item_start(marker) {
                Some((prefix, rest)) if rest.is_empty() && prefix.indent.is_empty() => Ok(()),
                _ => Err(ConfigError::InvalidListMarker(marker.clone())),
            }
        }

        pub fn state(&self, name: &str) -> Option<&TodoStateConfig> {
            self.todo_states.get(name)
        }

        pub fn marker_for(&self, state: &str) -> Option<&str> {
            self.state(state).map(|s| s.marker.as_str())
        }

        pub fn markdown_for(&self, state: &str) -> Option<char> {
            self.state(state).map(|s| s.markdown)
        }

        pub fn state_kind(&self, state: &str) -> Option<StateKind> {
            self.state(state).map(|s| s.kind)
        }

        pub fn is_complete(&self, state: &str) -> bool {
            self.state_kind(state) == Some(StateKind::Complete)
        }

        pub fn is_incomplete(&self, state: &str) -> bool {
            self.state_kind(state) == Some(StateKind::Incomplete)
        }

        /// State named by a portable checkbox character. Letters match case-insensitively.
        pub fn state_for_markdown(&self, ch: char) -> Option<&str> {
            self.todo_states
                .iter()
                .find(|(_, state)| {
                    state.markdown == ch
                        || (state.markdown.is_ascii_alphabetic()
                            && state.markdown.eq_ignore_ascii_case(&ch))
                })
                .map(|(name, _)| name.as_str())
        }

        /// `checked` goes back to `unchecked`; every other state goes to `checked`.
        pub fn toggle_target(&self, current: &str) -> &'static str {
            if current == CHECKED { UNCHECKED } else { CHECKED }
        }

        /// Canonical name for a tag or one of its aliases.
        pub fn canonical_tag<'a>(&'a self, name: &str) -> Option<&'a str> {
            self.metadata.iter().find_map(|(canonical, tag)| {
                (canonical == name || tag.aliases.iter().any(|alias| alias == name))
                    .then_some(canonical.as_str())
            })
        }

        pub fn default_list_marker(&self) -> ListMarker {
            ListMarker::from_token(&self.list_style.default_marker)
        }
    }

    pub(crate) fn is_valid_tag_name(name: &str) -> bool {
        !name.is_empty() && name.chars().all(crate::metadata::is_tag_char)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn default_config_is_valid() {
            Config::default().validate().expect("default config");
        }

        #[test]
        fn loading_custom_states_keeps_required_defaults() {
            let config = Config::from_json_str(
                r#"{"todo_states": {"in_progress": {"marker": "◐", "markdown": "."}}}"#,
            )
            .expect("parse");
            let names: Vec<&str> = config.todo_states.keys().map(String::as_str).collect();
            assert_eq!(names, vec![UNCHECKED, CHECKED, "in_progress"]);
            assert_eq!(config.state_kind("in_progress"), Some(StateKind::Incomplete));
            assert_eq!(config.state_for_markdown('.'), Some("in_progress"));
        }

        #[test]
        fn duplicate_markers_are_rejected() {
            let err = Config::from_json_str(
                r#"{"todo_states": {"waiting": {"marker": "☐", "markdown": "w"}}}"#,
            )
            .expect_err("duplicate marker");
            assert!(matches!(err, ConfigError::DuplicateMarker { .. }));
        }

        #[test]
        fn whitespace_markdown_is_only_allowed_for_unchecked() {
            let err = Config::from_json_str(
                r#"{"todo_states": {"waiting": {"marker": "…", "markdown": "\t"}}}"#,
            )
            .expect_err("tab markdown");
            assert!(matches!(err, ConfigError::InvalidMarkdown { .. }));
        }

        #[test]
        fn alias_collisions_are_rejected() {
            let err = Config::from_json_str(
                r#"{"metadata": {"due": {"aliases": ["when"]}, "when": {}}}"#,
            )
            .expect_err("alias collision");
            assert!(matches!(err, ConfigError::DuplicateTag(name) if name == "when"));
        }

        #[test]
        fn default_list_marker_must_be_a_bare_bullet() {
            let mut config = Config::default();
            config.list_style.default_marker = "->".into();
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidListMarker(_))
            ));
            config.list_style.default_marker = "1.".into();
            config.validate().expect("ordered marker");
        }

        #[test]
        fn markdown_lookup_is_case_insensitive_for_letters() {
            let config = Config::default();
            assert_eq!(config.state_for_markdown('x'), Some(CHECKED));
            assert_eq!(config.state_for_markdown('X'), Some(CHECKED));
            assert_eq!(config.state_for_markdown(' '), Some(UNCHECKED));
            assert_eq!(config.state_for_markdown('?'), None);
        }

        #[test]
        fn aliases_resolve_to_canonical_tags() {
            let config = Config::default();
            assert_eq!(config.canonical_tag("completed"), Some("done"));
            assert_eq!(config.canonical_tag("done"), Some("done"));
            assert_eq!(config.canonical_tag("nope"), None);
        }
    }
}

pub mod syntax {
    //! Structural parse of a document into list, list-item, marker and paragraph nodes.
    //!
    //! Parsing strategy:
    //! - Line-oriented scan keeping a stack of open list items keyed by content column.
    //! - List markers are recognized with `nom` combinators.
    //! - Fenced code and ATX headings are tracked only so they terminate lists correctly.

    use crate::core::{ListMarkerKind, NodeId, Position, Range};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::take_while_m_n,
        character::complete::{one_of, space0},
        combinator::{map, recognize},
        error::VerboseError,
        sequence::pair,
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    const TAB_WIDTH: usize = 4;

    /* ------------------------------- Tree ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum NodeKind {
        Document,
        List,
        ListItem,
        ListMarker,
        Paragraph,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SyntaxNode {
        pub id: NodeId,
        pub kind: NodeKind,
        pub range: Range,
        pub parent: Option<NodeId>,
        pub children: Vec<NodeId>,
    }

    /// Arena of nodes stored in document order. Index 0 is the document root.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SyntaxTree {
        nodes: Vec<SyntaxNode>,
    }

    impl SyntaxTree {
        pub fn new(lines: &[String]) -> Self {
            let end = match lines.last() {
                Some(last) => Position::new(lines.len() - 1, last.len()),
                None => Position::default(),
            };
            Self {
                nodes: vec![SyntaxNode {
                    id: NodeId(0),
                    kind: NodeKind::Document,
                    range: Range::new(Position::default(), end),
                    parent: None,
                    children: Vec::new(),
                }],
            }
        }

        pub fn root(&self) -> NodeId {
            NodeId(0)
        }

        pub fn node(&self, id: NodeId) -> Option<&SyntaxNode> {
            self.nodes.get(id.0)
        }

        pub fn len(&self) -> usize {
            self.nodes.len()
        }

        pub fn is_empty(&self) -> bool {
            self.nodes.len() <= 1
        }

        pub fn children(&self, id: NodeId) -> &[NodeId] {
            self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
        }

        pub fn nodes_of_kind(&self, kind: NodeKind) -> impl Iterator<Item = &SyntaxNode> + '_ {
            self.nodes.iter().filter(move |n| n.kind == kind)
        }

        pub fn list_items(&self) -> impl Iterator<Item = &SyntaxNode> + '_ {
            self.nodes_of_kind(NodeKind::ListItem)
        }

        pub fn lists(&self) -> impl Iterator<Item = &SyntaxNode> + '_ {
            self.nodes_of_kind(NodeKind::List)
        }

        pub fn paragraphs(&self) -> impl Iterator<Item = &SyntaxNode> + '_ {
            self.nodes_of_kind(NodeKind::Paragraph)
        }

        pub fn marker_of(&self, item: NodeId) -> Option<&SyntaxNode> {
            self.child_of_kind(item, NodeKind::ListMarker)
        }

        /// Paragraph that starts on the item's marker row, if the item has inline content.
        pub fn first_paragraph_of(&self, item: NodeId) -> Option<&SyntaxNode> {
            let row = self.node(item)?.range.start.row;
            self.children(item)
                .iter()
                .filter_map(|id| self.node(*id))
                .find(|n| n.kind == NodeKind::Paragraph && n.range.start.row == row)
        }

        /// Nearest list-item ancestor, excluding `id` itself.
        pub fn enclosing_list_item(&self, id: NodeId) -> Option<&SyntaxNode> {
            let mut cursor = self.node(id)?.parent;
            while let Some(parent) = cursor {
                let node = self.node(parent)?;
                if node.kind == NodeKind::ListItem {
                    return Some(node);
                }
                cursor = node.parent;
            }
            None
        }

        fn child_of_kind(&self, id: NodeId, kind: NodeKind) -> Option<&SyntaxNode> {
            self.children(id)
                .iter()
                .filter_map(|c| self.node(*c))
                .find(|n| n.kind == kind)
        }

        fn push(&mut self, kind: NodeKind, range: Range, parent: NodeId) -> NodeId {
            let id = NodeId(self.nodes.len());
            self.nodes.push(SyntaxNode {
                id,
                kind,
                range,
                parent: Some(parent),
                children: Vec::new(),
            });
            if let Some(p) = self.nodes.get_mut(parent.0) {
                p.children.push(id);
            }
            id
        }

        /// Grow `id` and every ancestor so their ranges reach at least `end`.
        fn extend_to(&mut self, id: NodeId, end: Position) {
            let mut cursor = Some(id);
            while let Some(current) = cursor {
                let Some(node) = self.nodes.get_mut(current.0) else {
                    break;
                };
                if node.range.end < end {
                    node.range.end = end;
                }
                cursor = node.parent;
            }
        }
    }

    /* ------------------------------ Parser ------------------------------ */

    /// Seam for swapping in another structural parser (e.g. a host's incremental one).
    pub trait StructuralParser {
        fn parse(&self, lines: &[String]) -> SyntaxTree;
    }

    /// Line-oriented CommonMark-flavoured list parser.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct MarkdownListParser;

    impl StructuralParser for MarkdownListParser {
        fn parse(&self, lines: &[String]) -> SyntaxTree {
            let mut builder = Builder::new(lines);
            for (row, line) in lines.iter().enumerate() {
                builder.line(row, line);
            }
            builder.tree
        }
    }

    struct OpenItem {
        node: NodeId,
        content_indent: usize,
        /// Nested list currently accepting items, with its bullet or delimiter.
        child_list: Option<(NodeId, char)>,
    }

    struct Fence {
        ch: char,
        len: usize,
    }

    struct Builder {
        tree: SyntaxTree,
        stack: Vec<OpenItem>,
        top_list: Option<(NodeId, char)>,
        paragraph: Option<NodeId>,
        fence: Option<Fence>,
    }

    impl Builder {
        fn new(lines: &[String]) -> Self {
            Self {
                tree: SyntaxTree::new(lines),
                stack: Vec::new(),
                top_list: None,
                paragraph: None,
                fence: None,
            }
        }

        fn line(&mut self, row: usize, line: &str) {
            let end = Position::new(row, line.len());
            let trimmed = line.trim_start();

            if let Some(fence) = &self.fence {
                if fence_closes(fence, trimmed) {
                    self.fence = None;
                }
                if !trimmed.is_empty() {
                    self.extend_open_item(end);
                }
                return;
            }

            if trimmed.is_empty() {
                self.paragraph = None;
                return;
            }

            let indent = visual_width(&line[..line.len() - trimmed.len()]);

            if let Some(fence) = fence_open(trimmed) {
                self.interrupt(indent, end);
                self.fence = Some(fence);
                return;
            }
            if is_atx_heading(trimmed) {
                self.interrupt(indent, end);
                return;
            }
            if let Some((prefix, rest)) = list_item_start(line) {
                self.open_item(row, line, prefix, rest);
                return;
            }

            if let Some(paragraph) = self.paragraph {
                self.tree.extend_to(paragraph, end);
                return;
            }

            self.close_items_below(indent);
            let start = Position::new(row, line.len() - trimmed.len());
            let range = Range::new(start, end);
            let parent = match self.stack.last_mut() {
                Some(item) => {
                    item.child_list = None;
                    item.node
                }
                None => {
                    self.top_list = None;
                    self.tree.root()
                }
            };
            let paragraph = self.tree.push(NodeKind::Paragraph, range, parent);
            self.tree.extend_to(paragraph, end);
            self.paragraph = Some(paragraph);
        }

        /// A block that is neither list nor paragraph: closes items it is not nested in.
        fn interrupt(&mut self, indent: usize, end: Position) {
            self.close_items_below(indent);
            self.paragraph = None;
            match self.stack.last_mut() {
                Some(item) => item.child_list = None,
                None => self.top_list = None,
            }
            self.extend_open_item(end);
        }

        fn extend_open_item(&mut self, end: Position) {
            if let Some(item) = self.stack.last() {
                let node = item.node;
                self.tree.extend_to(node, end);
            }
        }

        fn close_items_below(&mut self, indent: usize) {
            while self
                .stack
                .last()
                .is_some_and(|item| indent < item.content_indent)
            {
                self.stack.pop();
            }
        }

        fn open_item(&mut self, row: usize, line: &str, prefix: ListPrefix<'_>, rest: &str) {
            let end = Position::new(row, line.len());
            let marker_col = prefix.indent.len();
            let marker_end = marker_col + prefix.marker.len();
            let indent = visual_width(prefix.indent);
            self.close_items_below(indent);

            let content = rest.trim_start();
            let gap = visual_width(&rest[..rest.len() - content.len()]);
            let marker_width = prefix.marker.chars().count();
            let content_indent = if content.is_empty() || gap > 4 {
                indent + marker_width + 1
            } else {
                indent + marker_width + gap
            };

            let delimiter = prefix.marker.chars().last().unwrap_or('-');
            let container = self.stack.last().map(|item| item.node);
            let current = match self.stack.last() {
                Some(item) => item.child_list,
                None => self.top_list,
            };
            let list = match current {
                Some((list, delim)) if delim == delimiter => list,
                _ => {
                    let parent = container.unwrap_or(self.tree.root());
                    let range = Range::new(Position::new(row, marker_col), end);
                    let list = self.tree.push(NodeKind::List, range, parent);
                    match self.stack.last_mut() {
                        Some(item) => item.child_list = Some((list, delimiter)),
                        None => self.top_list = Some((list, delimiter)),
                    }
                    list
                }
            };

            let item_range = Range::new(Position::new(row, marker_col), end);
            let item = self.tree.push(NodeKind::ListItem, item_range, list);
            self.tree.push(
                NodeKind::ListMarker,
                Range::on_row(row, marker_col, marker_end),
                item,
            );
            self.tree.extend_to(item, end);

            self.paragraph = if content.is_empty() {
                None
            } else {
                let start = Position::new(row, line.len() - content.len());
                Some(
                    self.tree
                        .push(NodeKind::Paragraph, Range::new(start, end), item),
                )
            };

            self.stack.push(OpenItem {
                node: item,
                content_indent,
                child_list: None,
            });
        }
    }

    /* ------------------------------- Utils ------------------------------- */

    fn visual_width(s: &str) -> usize {
        s.chars().fold(0, |width, c| {
            if c == '\t' {
                width + TAB_WIDTH - width % TAB_WIDTH
            } else {
                width + 1
            }
        })
    }

    fn fence_open(trimmed: &str) -> Option<Fence> {
        let ch = trimmed.chars().next().filter(|c| matches!(c, '`' | '~'))?;
        let len = trimmed.chars().take_while(|c| *c == ch).count();
        (len >= 3).then_some(Fence { ch, len })
    }

    fn fence_closes(fence: &Fence, trimmed: &str) -> bool {
        let len = trimmed.chars().take_while(|c| *c == fence.ch).count();
        len >= fence.len && trimmed[len * fence.ch.len_utf8()..].trim().is_empty()
    }

    fn is_atx_heading(trimmed: &str) -> bool {
        let hashes = trimmed.chars().take_while(|c| *c == '#').count();
        (1..=6).contains(&hashes)
            && trimmed[hashes..]
                .chars()
                .next()
                .is_none_or(|c| c == ' ' || c == '\t')
    }

    /* --------------------------- List markers --------------------------- */

    /// Leading part of a list item line: indentation and the marker token.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ListPrefix<'a> {
        pub indent: &'a str,
        pub marker: &'a str,
        pub kind: ListMarkerKind,
    }

    /// Indentation followed by `-`, `*`, `+` or 1–9 digits and `.`/`)`.
    pub fn list_prefix(i: &str) -> PResult<'_, ListPrefix<'_>> {
        let (i, indent) = space0(i)?;
        let (i, (marker, kind)) = alt((
            map(recognize(one_of("-*+")), |m: &str| {
                (m, ListMarkerKind::Unordered)
            }),
            map(
                recognize(pair(
                    take_while_m_n(1, 9, |c: char| c.is_ascii_digit()),
                    one_of(".)"),
                )),
                |m: &str| (m, ListMarkerKind::Ordered),
            ),
        ))(i)?;
        Ok((i, ListPrefix { indent, marker, kind }))
    }

    /// A list item line: the marker must be followed by whitespace or end of line.
    pub fn list_item_start(line: &str) -> Option<(ListPrefix<'_>, &str)> {
        let (rest, prefix) = list_prefix(line).ok()?;
        (rest.is_empty() || rest.starts_with([' ', '\t'])).then_some((prefix, rest))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn lines(text: &str) -> Vec<String> {
            text.lines().map(str::to_string).collect()
        }

        fn item_rows(tree: &SyntaxTree) -> Vec<(usize, usize)> {
            tree.list_items()
                .map(|n| (n.range.start.row, n.range.end.row))
                .collect()
        }

        #[test]
        fn list_prefix_recognizes_bullets_and_ordinals() {
            let (rest, p) = list_prefix("  - task").expect("bullet");
            assert_eq!((p.indent, p.marker, p.kind), ("  ", "-", ListMarkerKind::Unordered));
            assert_eq!(rest, " task");

            let (_, p) = list_prefix("12) step").expect("ordinal");
            assert_eq!((p.marker, p.kind), ("12)", ListMarkerKind::Ordered));

            assert!(list_prefix("1234567890. too long").is_err());
            assert!(list_item_start("-x").is_none());
            assert!(list_item_start("*").is_some());
        }

        #[test]
        fn nested_items_follow_content_column() {
            let text = lines("- a\n  - b\n    - c\n  - d\n- e");
            let tree = MarkdownListParser.parse(&text);
            assert_eq!(item_rows(&tree), vec![(0, 3), (1, 2), (2, 2), (3, 3), (4, 4)]);

            let items: Vec<&SyntaxNode> = tree.list_items().collect();
            let parent_of = |idx: usize| tree.enclosing_list_item(items[idx].id).map(|n| n.id);
            assert_eq!(parent_of(0), None);
            assert_eq!(parent_of(1), Some(items[0].id));
            assert_eq!(parent_of(2), Some(items[1].id));
            assert_eq!(parent_of(3), Some(items[0].id));
            assert_eq!(parent_of(4), None);
            assert_eq!(tree.lists().count(), 3);
        }

        #[test]
        fn changing_bullet_starts_a_new_list() {
            let tree = MarkdownListParser.parse(&lines("- a\n- b\n* c\n1. d\n2) e"));
            assert_eq!(tree.lists().count(), 4);
        }

        #[test]
        fn continuation_lines_extend_the_paragraph() {
            let text = lines("- first line\n  indented\nlazy\n\n  second para\n\nafter");
            let tree = MarkdownListParser.parse(&text);
            let item = tree.list_items().next().expect("item");
            assert_eq!(item.range.end, Position::new(4, "  second para".len()));

            let first = tree.first_paragraph_of(item.id).expect("first paragraph");
            assert_eq!(first.range.start, Position::new(0, 2));
            assert_eq!(first.range.end, Position::new(2, 4));

            let root_paragraphs: Vec<_> = tree
                .paragraphs()
                .filter(|p| p.parent == Some(tree.root()))
                .collect();
            assert_eq!(root_paragraphs.len(), 1);
            assert_eq!(root_paragraphs[0].range.start.row, 6);
        }

        #[test]
        fn markers_inside_fences_are_not_items() {
            let text = lines("- a\n\n  ```\n  - not an item\n  ```\n- b\n```\n- code\n```");
            let tree = MarkdownListParser.parse(&text);
            assert_eq!(item_rows(&tree), vec![(0, 4), (5, 5)]);
        }

        #[test]
        fn headings_close_lists() {
            let tree = MarkdownListParser.parse(&lines("- a\n# Heading\n- b"));
            assert_eq!(tree.lists().count(), 2);
            assert_eq!(item_rows(&tree), vec![(0, 0), (2, 2)]);
        }

        #[test]
        fn tabs_expand_to_four_columns() {
            let tree = MarkdownListParser.parse(&lines("- a\n\t- b"));
            let items: Vec<&SyntaxNode> = tree.list_items().collect();
            assert_eq!(tree.enclosing_list_item(items[1].id).map(|n| n.id), Some(items[0].id));
            let marker = tree.marker_of(items[1].id).expect("marker");
            assert_eq!(marker.range, Range::on_row(1, 1, 2));
        }
    }
}

pub mod discovery {
    //! Flattens the syntax tree into `ListItem`s, in document order.

    use crate::core::{ListItem, ListMarker, NodeId, Range};
    use crate::syntax::{NodeKind, SyntaxTree};

    pub fn discover_list_items(tree: &SyntaxTree, lines: &[String]) -> Vec<ListItem> {
        tree.list_items()
            .map(|node| {
                let marker_range = tree.marker_of(node.id).map(|m| m.range).unwrap_or_else(|| {
                    Range::on_row(node.range.start.row, node.range.start.col, node.range.start.col)
                });
                let token = lines
                    .get(marker_range.start.row)
                    .and_then(|line| line.get(marker_range.start.col..marker_range.end.col))
                    .unwrap_or_default();

                ListItem {
                    node: node.id,
                    range: node.range,
                    parent: tree.enclosing_list_item(node.id).map(|p| p.id),
                    children: child_items(tree, node.id),
                    list_marker: ListMarker::from_token(token),
                    marker_range,
                }
            })
            .collect()
    }

    fn child_items(tree: &SyntaxTree, item: NodeId) -> Vec<NodeId> {
        tree.children(item)
            .iter()
            .filter_map(|id| tree.node(*id))
            .filter(|n| n.kind == NodeKind::List)
            .flat_map(|list| tree.children(list.id).iter().copied())
            .collect()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::ListMarkerKind;
        use crate::syntax::{MarkdownListParser, StructuralParser};

        #[test]
        fn items_record_marker_parent_and_children() {
            let lines: Vec<String> = ["1. parent", "   - child one", "   - child two", "2) other"]
                .into_iter()
                .map(String::from)
                .collect();
            let tree = MarkdownListParser.parse(&lines);
            let items = discover_list_items(&tree, &lines);

            assert_eq!(items.len(), 4);
            assert_eq!(items[0].list_marker.text, "1.");
            assert_eq!(items[0].list_marker.kind, ListMarkerKind::Ordered);
            assert_eq!(items[0].children, vec![items[1].node, items[2].node]);
            assert_eq!(items[1].parent, Some(items[0].node));
            assert_eq!(items[1].list_marker.kind, ListMarkerKind::Unordered);
            assert_eq!(items[1].marker_range, Range::on_row(1, 3, 4));
            assert_eq!(items[3].list_marker.text, "2)");
            assert_eq!(items[3].parent, None);
        }
    }
}

pub mod classify {
    //! Decides whether a list item line is a todo, and in which state.

    use crate::config::Config;
    use crate::core::ListMarker;
    use crate::syntax::list_prefix;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TodoMatch {
        pub state: String,
        pub glyph: String,
        /// Byte column of the glyph.
        pub glyph_col: usize,
        /// Byte column where the todo text starts (line length when empty).
        pub content_col: usize,
        pub list_marker: ListMarker,
    }

    /// Glyph table compiled from a `Config`. Rebuild it whenever the config changes.
    #[derive(Debug, Clone)]
    pub struct TodoClassifier {
        /// `(glyph, state)`, longest glyph first so prefixes never shadow longer glyphs.
        glyphs: Vec<(String, String)>,
    }

    impl TodoClassifier {
        pub fn new(config: &Config) -> Self {
            let mut glyphs: Vec<(String, String)> = config
                .todo_states
                .iter()
                .map(|(name, state)| (state.marker.clone(), name.clone()))
                .collect();
            glyphs.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
            Self { glyphs }
        }

        /// `<indent><marker> <glyph>` followed by a space or end of line.
        pub fn classify(&self, line: &str) -> Option<TodoMatch> {
            let (rest, prefix) = list_prefix(line).ok()?;
            let after = rest.strip_prefix(' ')?;
            let glyph_col = line.len() - after.len();

            let (glyph, state) = self.glyphs.iter().find(|(glyph, _)| {
                after
                    .strip_prefix(glyph.as_str())
                    .is_some_and(|tail| tail.is_empty() || tail.starts_with(' '))
            })?;

            let tail = &after[glyph.len()..];
            let content_col = if tail.is_empty() {
                line.len()
            } else {
                glyph_col + glyph.len() + 1
            };

            Some(TodoMatch {
                state: state.clone(),
                glyph: glyph.clone(),
                glyph_col,
                content_col,
                list_marker: ListMarker::from_token(prefix.marker),
            })
        }
    }

}

pub mod metadata {
    //! Inline `@tag(value)` metadata and value-choice providers.
    //!
    //! Values may nest parentheses (`@issue(fix(api))`); a backslash escapes the next character.
    //! A candidate left unbalanced at end of line is skipped and scanning resumes after its `@`.

    use crate::config::{Config, MetadataDefault};
    use crate::core::{DocumentId, MetadataEntry, MetadataSet, Range, TodoItem};
    use chrono::Local;
    use nom::{
        IResult,
        bytes::complete::take_while1,
        character::complete::char,
        error::VerboseError,
        sequence::delimited,
    };
    use std::{
        cell::{Cell, RefCell},
        collections::HashMap,
        fmt,
        rc::Rc,
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    pub fn is_tag_char(c: char) -> bool {
        c.is_alphanumeric() || c == '-' || c == '_'
    }

    fn tag_open(i: &str) -> PResult<'_, &str> {
        delimited(char('@'), take_while1(is_tag_char), char('('))(i)
    }

    /// Byte offset of the paren closing an already opened value.
    fn closing_paren(value: &str) -> Option<usize> {
        let mut depth = 1usize;
        let mut escaped = false;
        for (idx, c) in value.char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                '\\' => escaped = true,
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(idx);
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Parens inside a value must balance once escapes are accounted for.
    pub fn is_balanced_value(value: &str) -> bool {
        let mut wrapped = String::with_capacity(value.len() + 1);
        wrapped.push_str(value);
        wrapped.push(')');
        closing_paren(&wrapped) == Some(value.len())
    }

    /* ----------------------------- Extraction ----------------------------- */

    #[derive(Debug, Clone)]
    pub struct MetadataExtractor {
        /// alias → canonical tag
        aliases: HashMap<String, String>,
    }

    impl MetadataExtractor {
        pub fn new(config: &Config) -> Self {
            let aliases = config
                .metadata
                .iter()
                .flat_map(|(canonical, tag)| {
                    tag.aliases
                        .iter()
                        .map(move |alias| (alias.clone(), canonical.clone()))
                })
                .collect();
            Self { aliases }
        }

        /// Scan each row segment of `range` independently, left to right.
        pub fn extract(&self, lines: &[String], range: Range) -> MetadataSet {
            let mut set = MetadataSet::default();
            for row in range.start.row..=range.end.row {
                let Some(line) = lines.get(row) else {
                    break;
                };
                let start = if row == range.start.row { range.start.col } else { 0 };
                let end = if row == range.end.row {
                    range.end.col.min(line.len())
                } else {
                    line.len()
                };
                if let Some(segment) = line.get(start..end) {
                    self.scan_segment(row, start, segment, &mut set);
                }
            }
            set
        }

        fn scan_segment(&self, row: usize, base: usize, segment: &str, set: &mut MetadataSet) {
            let mut offset = 0;
            while let Some(found) = segment[offset..].find('@') {
                let at = offset + found;
                let candidate = &segment[at..];
                let Ok((value_part, tag)) = tag_open(candidate) else {
                    offset = at + 1;
                    continue;
                };
                let value_start = at + (candidate.len() - value_part.len());
                let Some(close) = closing_paren(value_part) else {
                    tracing::debug!(row, col = base + at, tag, "skipping unbalanced metadata");
                    offset = at + 1;
                    continue;
                };
                let close_col = value_start + close;
                set.push(MetadataEntry {
                    tag: tag.to_string(),
                    alias_for: self.aliases.get(tag).cloned(),
                    value: segment[value_start..close_col].trim().to_string(),
                    range: Range::on_row(row, base + at, base + close_col + 1),
                    value_range: Range::on_row(row, base + value_start, base + close_col),
                });
                offset = close_col + 1;
            }
        }
    }

    /// Value used when a tag is added without one.
    pub fn default_value(config: &Config, tag: &str) -> String {
        let canonical = config.canonical_tag(tag).unwrap_or(tag);
        match config.metadata.get(canonical).map(|t| &t.default) {
            Some(MetadataDefault::Date) => format_now(&config.date_format),
            Some(MetadataDefault::DateTime) => format_now(&config.datetime_format),
            Some(MetadataDefault::Text(text)) => text.clone(),
            Some(MetadataDefault::Empty) | None => String::new(),
        }
    }

    fn format_now(format: &str) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        if write!(out, "{}", Local::now().format(format)).is_err() {
            tracing::warn!(format, "invalid date format in config");
            out.clear();
        }
        out
    }

    /* ---------------------------- Value providers ---------------------------- */

    /// What a provider is asked about.
    #[derive(Debug, Clone)]
    pub struct ChoiceContext {
        pub document: DocumentId,
        /// Canonical tag name.
        pub tag: String,
        pub todo: Option<TodoItem>,
    }

    pub type SyncProvider = Rc<dyn Fn(&ChoiceContext) -> Vec<String>>;
    pub type AsyncProvider = Rc<dyn Fn(&ChoiceContext, Completion)>;

    #[derive(Clone)]
    pub enum ValueProvider {
        Static(Vec<String>),
        Sync(SyncProvider),
        /// Completes later through the handed `Completion`.
        Async(AsyncProvider),
    }

    impl fmt::Debug for ValueProvider {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                ValueProvider::Static(choices) => f.debug_tuple("Static").field(choices).finish(),
                ValueProvider::Sync(_) => f.write_str("Sync(..)"),
                ValueProvider::Async(_) => f.write_str("Async(..)"),
            }
        }
    }

    type OnReady = Box<dyn FnOnce(Vec<String>)>;

    struct CompletionState {
        tag: String,
        on_ready: RefCell<Option<OnReady>>,
        duplicates: Cell<usize>,
    }

    /// Single-fire delivery of choices. Clones share the same guard.
    #[derive(Clone)]
    pub struct Completion {
        inner: Rc<CompletionState>,
    }

    impl Completion {
        fn new(tag: &str, on_ready: OnReady) -> Self {
            Self {
                inner: Rc::new(CompletionState {
                    tag: tag.to_string(),
                    on_ready: RefCell::new(Some(on_ready)),
                    duplicates: Cell::new(0),
                }),
            }
        }

        /// Deliver choices. Returns `false` (and records it) when already completed.
        pub fn complete(&self, choices: Vec<String>) -> bool {
            let pending = self.inner.on_ready.borrow_mut().take();
            match pending {
                Some(on_ready) => {
                    on_ready(choices);
                    true
                }
                None => {
                    self.inner.duplicates.set(self.inner.duplicates.get() + 1);
                    tracing::warn!(
                        tag = %self.inner.tag,
                        "value provider completed more than once"
                    );
                    false
                }
            }
        }

        pub fn is_complete(&self) -> bool {
            self.inner.on_ready.borrow().is_none()
        }

        pub fn duplicate_completions(&self) -> usize {
            self.inner.duplicates.get()
        }
    }

    impl fmt::Debug for Completion {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Completion")
                .field("tag", &self.inner.tag)
                .field("complete", &self.is_complete())
                .field("duplicates", &self.duplicate_completions())
                .finish()
        }
    }

    /// Dispatch once to `provider`. Static and sync providers complete before this returns.
    pub fn request_choices(
        provider: &ValueProvider,
        cx: &ChoiceContext,
        on_ready: impl FnOnce(Vec<String>) + 'static,
    ) -> Completion {
        let completion = Completion::new(&cx.tag, Box::new(on_ready));
        match provider {
            ValueProvider::Static(choices) => {
                completion.complete(choices.clone());
            }
            ValueProvider::Sync(f) => {
                completion.complete(f(cx));
            }
            ValueProvider::Async(f) => f(cx, completion.clone()),
        }
        completion
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::Position;

        fn extract(line: &str) -> MetadataSet {
            let lines = vec![line.to_string()];
            MetadataExtractor::new(&Config::default())
                .extract(&lines, Range::on_row(0, 0, line.len()))
        }

        #[test]
        fn nested_parens_stay_in_the_value() {
            let set = extract("- ☐ Fix login @issue(fix(api)) soon");
            let entry = set.get("issue").expect("issue tag");
            assert_eq!(entry.value, "fix(api)");
            let start = "- ☐ Fix login ".len();
            assert_eq!(entry.range, Range::on_row(0, start, start + "@issue(fix(api))".len()));
            assert_eq!(entry.value_range.end, Position::new(0, start + "@issue(fix(api)".len()));
        }

        #[test]
        fn last_occurrence_wins_by_tag() {
            let set = extract("task @p(low) @p( high )");
            assert_eq!(set.len(), 2);
            assert_eq!(set.get("p").map(|e| e.value.as_str()), Some("high"));
            assert_eq!(set.entries[0].value, "low");
        }

        #[test]
        fn malformed_candidates_are_skipped() {
            let set = extract("mail a@b.c, @broken(oops @ok(yes) @(x) @esc(a\\)b)");
            let tags: Vec<&str> = set.entries.iter().map(|e| e.tag.as_str()).collect();
            assert_eq!(tags, vec!["ok", "esc"]);
            assert_eq!(set.get("esc").map(|e| e.value.as_str()), Some("a\\)b"));
        }

        #[test]
        fn whitespace_inside_the_opener_is_not_a_tag() {
            let set = extract("x @tag (a) @ tag(b) @ok(c)");
            let tags: Vec<&str> = set.entries.iter().map(|e| e.tag.as_str()).collect();
            assert_eq!(tags, vec!["ok"]);
        }

        #[test]
        fn aliases_resolve_but_stay_keyed_by_alias() {
            let set = extract("x @completed(2024-01-02)");
            let entry = set.get("completed").expect("alias key");
            assert_eq!(entry.alias_for.as_deref(), Some("done"));
            assert_eq!(set.get_canonical("done").map(|e| e.value.as_str()), Some("2024-01-02"));
            assert!(set.get("done").is_none());
        }

        #[test]
        fn extraction_respects_range_columns_per_row() {
            let lines = vec!["@a(1) - ☐ text @b(2)".to_string(), "  @c(3) @d(4)".to_string()];
            let start = "@a(1) - ☐ ".len();
            let range = Range::new(Position::new(0, start), Position::new(1, "  @c(3)".len()));
            let set = MetadataExtractor::new(&Config::default()).extract(&lines, range);
            let tags: Vec<&str> = set.entries.iter().map(|e| e.tag.as_str()).collect();
            assert_eq!(tags, vec!["b", "c"]);
        }

        #[test]
        fn balanced_values() {
            assert!(is_balanced_value("fix(api)"));
            assert!(is_balanced_value("a\\(b"));
            assert!(!is_balanced_value("a(b"));
            assert!(!is_balanced_value("a)b"));
        }

        #[test]
        fn defaults_follow_config() {
            let config = Config::default();
            assert_eq!(default_value(&config, "priority"), "medium");
            assert_eq!(default_value(&config, "unknown"), "");
            let today = Local::now().format("%Y-%m-%d").to_string();
            assert_eq!(default_value(&config, "completed"), today);
        }

        #[test]
        fn completion_fires_once() {
            let received = Rc::new(RefCell::new(Vec::new()));
            let stash: Rc<RefCell<Option<Completion>>> = Rc::new(RefCell::new(None));

            let provider = ValueProvider::Async(Rc::new({
                let stash = stash.clone();
                move |_cx: &ChoiceContext, completion: Completion| {
                    *stash.borrow_mut() = Some(completion);
                }
            }));
            let cx = ChoiceContext {
                document: DocumentId::new(),
                tag: "owner".into(),
                todo: None,
            };
            let sink = received.clone();
            let completion = request_choices(&provider, &cx, move |choices| {
                sink.borrow_mut().push(choices)
            });
            assert!(!completion.is_complete());

            let later = stash.borrow_mut().take().expect("provider kept completion");
            assert!(later.complete(vec!["alice".into()]));
            assert!(!later.complete(vec!["bob".into()]));
            assert!(completion.is_complete());
            assert_eq!(completion.duplicate_completions(), 1);
            assert_eq!(*received.borrow(), vec![vec!["alice".to_string()]]);
        }

        #[test]
        fn static_choices_complete_immediately() {
            let cx = ChoiceContext {
                document: DocumentId::new(),
                tag: "priority".into(),
                todo: None,
            };
            let got = Rc::new(RefCell::new(None));
            let sink = got.clone();
            let provider = ValueProvider::Static(vec!["low".into(), "high".into()]);
            let completion = request_choices(&provider, &cx, move |c| *sink.borrow_mut() = Some(c));
            assert!(completion.is_complete());
            assert_eq!(got.borrow().as_ref().map(Vec::len), Some(2));
        }
    }
}

pub mod document {
    //! In-memory line buffer with row-tracking marks that carry todo ids through edits.

    use crate::core::{DocumentId, PatchError, TodoId};
    use crate::patch::{self, Hunk};
    use std::{
        collections::{BTreeMap, HashMap, HashSet},
        fs, io,
        path::Path,
    };

    /// Row-keyed marks. Updated only by hunk application and pruned after each discovery pass.
    #[derive(Debug, Clone, Default)]
    pub struct MarkRegistry {
        by_row: BTreeMap<usize, TodoId>,
        rows: HashMap<TodoId, usize>,
    }

    impl MarkRegistry {
        /// Id of the mark on `row`, creating one if the row has none.
        pub fn acquire(&mut self, row: usize) -> TodoId {
            if let Some(id) = self.by_row.get(&row) {
                return *id;
            }
            let id = TodoId::new();
            self.by_row.insert(row, id);
            self.rows.insert(id, row);
            id
        }

        pub fn row_of(&self, id: TodoId) -> Option<usize> {
            self.rows.get(&id).copied()
        }

        pub fn id_at(&self, row: usize) -> Option<TodoId> {
            self.by_row.get(&row).copied()
        }

        pub fn retain(&mut self, keep: &HashSet<TodoId>) {
            self.by_row.retain(|_, id| keep.contains(id));
            self.rows.retain(|id, _| keep.contains(id));
        }

        pub fn len(&self) -> usize {
            self.rows.len()
        }

        pub fn is_empty(&self) -> bool {
            self.rows.is_empty()
        }

        /// Rows `start..end` are replaced by `new_len` rows. Marks below shift by the delta;
        /// marks inside survive only while the replacement still covers their row.
        pub fn splice(&mut self, start: usize, end: usize, new_len: usize) {
            let removed = end.saturating_sub(start);
            let tail = self.by_row.split_off(&start);
            for (row, id) in tail {
                let moved = if row >= end {
                    Some(row - removed + new_len)
                } else if row - start < new_len {
                    Some(row)
                } else {
                    None
                };
                match moved {
                    Some(new_row) => {
                        self.by_row.insert(new_row, id);
                        self.rows.insert(id, new_row);
                    }
                    None => {
                        self.rows.remove(&id);
                    }
                }
            }
        }
    }

    /// Terminator that followed a line in the source text.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LineEnding {
        Lf,
        CrLf,
    }

    impl LineEnding {
        pub fn as_str(self) -> &'static str {
            match self {
                LineEnding::Lf => "\n",
                LineEnding::CrLf => "\r\n",
            }
        }
    }

    #[derive(Debug, Clone)]
    pub struct Document {
        id: DocumentId,
        name: String,
        lines: Vec<String>,
        /// One per line. The last entry is only written when `trailing_newline` is set.
        endings: Vec<LineEnding>,
        trailing_newline: bool,
        marks: MarkRegistry,
        version: u64,
    }

    impl Document {
        pub fn from_text(name: impl Into<String>, text: &str) -> Self {
            let (lines, endings, trailing_newline) = split_lines(text);
            Self {
                id: DocumentId::new(),
                name: name.into(),
                lines,
                endings,
                trailing_newline,
                marks: MarkRegistry::default(),
                version: 0,
            }
        }

        pub fn from_path(path: &Path) -> io::Result<Self> {
            let text = fs::read_to_string(path)?;
            Ok(Self::from_text(path.display().to_string(), &text))
        }

        pub fn id(&self) -> DocumentId {
            self.id
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        pub fn lines(&self) -> &[String] {
            &self.lines
        }

        pub fn line(&self, row: usize) -> Option<&str> {
            self.lines.get(row).map(String::as_str)
        }

        pub fn line_count(&self) -> usize {
            self.lines.len()
        }

        /// Bumped by every non-empty applied batch.
        pub fn version(&self) -> u64 {
            self.version
        }

        pub fn marks(&self) -> &MarkRegistry {
            &self.marks
        }

        pub(crate) fn parts_mut(&mut self) -> (&[String], &mut MarkRegistry) {
            (&self.lines, &mut self.marks)
        }

        /// Ending given to rows that did not exist in the source text.
        fn default_ending(&self) -> LineEnding {
            self.endings.first().copied().unwrap_or(LineEnding::Lf)
        }

        /// Render back to text, each line with its own terminator.
        pub fn text(&self) -> String {
            let mut out = String::new();
            let last = self.lines.len().saturating_sub(1);
            for (row, (line, ending)) in self.lines.iter().zip(&self.endings).enumerate() {
                out.push_str(line);
                if row < last || self.trailing_newline {
                    out.push_str(ending.as_str());
                }
            }
            out
        }

        pub fn apply_hunks(&mut self, hunks: Vec<Hunk>) -> Result<(), PatchError> {
            if hunks.is_empty() {
                return Ok(());
            }
            let hunks = patch::normalize(hunks, self.lines.len())?;
            let fill = self.default_ending();
            for hunk in hunks.iter().rev() {
                // Rows replaced in place keep their terminator.
                let kept: Vec<LineEnding> = (0..hunk.new_lines.len())
                    .map(|i| {
                        if hunk.start_row + i < hunk.end_row {
                            self.endings[hunk.start_row + i]
                        } else {
                            fill
                        }
                    })
                    .collect();
                self.endings.splice(hunk.start_row..hunk.end_row, kept);
            }
            patch::apply_hunks(&mut self.lines, &mut self.marks, hunks)?;
            self.version += 1;
            Ok(())
        }

        /// Swap in new text as a line diff so marks on unchanged rows keep their ids.
        pub fn replace_text(&mut self, text: &str) -> Result<bool, PatchError> {
            let (lines, endings, trailing_newline) = split_lines(text);
            let hunks = patch::diff_lines(&self.lines, &lines);
            let changed = !hunks.is_empty()
                || endings != self.endings
                || trailing_newline != self.trailing_newline;
            self.apply_hunks(hunks)?;
            self.endings = endings;
            self.trailing_newline = trailing_newline;
            Ok(changed)
        }
    }

    /// Lines without terminators, the terminator of each, and whether the text ends in one.
    pub(crate) fn split_lines(text: &str) -> (Vec<String>, Vec<LineEnding>, bool) {
        let mut lines = Vec::new();
        let mut endings = Vec::new();
        let mut trailing_newline = false;
        for piece in text.split_inclusive('\n') {
            if let Some(line) = piece.strip_suffix("\r\n") {
                lines.push(line.to_string());
                endings.push(LineEnding::CrLf);
                trailing_newline = true;
            } else if let Some(line) = piece.strip_suffix('\n') {
                lines.push(line.to_string());
                endings.push(LineEnding::Lf);
                trailing_newline = true;
            } else {
                lines.push(piece.to_string());
                endings.push(endings.first().copied().unwrap_or(LineEnding::Lf));
                trailing_newline = false;
            }
        }
        (lines, endings, trailing_newline)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn text_round_trips_line_endings() {
            for text in ["a\nb\n", "a\nb", "a\r\nb\r\n", "", "\n"] {
                assert_eq!(Document::from_text("t", text).text(), text);
            }
        }

        #[test]
        fn mixed_line_endings_survive_edits() {
            let mut doc = Document::from_text("t", "a\r\nb\nc");
            assert_eq!(doc.text(), "a\r\nb\nc");

            doc.apply_hunks(vec![Hunk::replace_line(1, "B")]).expect("replace");
            assert_eq!(doc.text(), "a\r\nB\nc");

            doc.apply_hunks(vec![Hunk::insert(1, vec!["new".into()])])
                .expect("insert");
            assert_eq!(doc.text(), "a\r\nnew\r\nB\nc");

            doc.apply_hunks(vec![Hunk::delete(0, 2)]).expect("delete");
            assert_eq!(doc.text(), "B\nc");
        }

        #[test]
        fn replacing_only_line_endings_counts_as_a_change() {
            let mut doc = Document::from_text("t", "a\nb\n");
            assert!(!doc.replace_text("a\nb\n").expect("same"));
            assert!(doc.replace_text("a\r\nb\n").expect("endings"));
            assert_eq!(doc.text(), "a\r\nb\n");
            assert_eq!(doc.version(), 0);
        }

        #[test]
        fn marks_shift_below_and_survive_inside() {
            let mut marks = MarkRegistry::default();
            let above = marks.acquire(1);
            let inside = marks.acquire(3);
            let dropped = marks.acquire(4);
            let below = marks.acquire(6);

            // rows 3..5 become a single row
            marks.splice(3, 5, 1);
            assert_eq!(marks.row_of(above), Some(1));
            assert_eq!(marks.row_of(inside), Some(3));
            assert_eq!(marks.row_of(dropped), None);
            assert_eq!(marks.row_of(below), Some(5));
            assert_eq!(marks.id_at(5), Some(below));
            assert_eq!(marks.len(), 3);
        }

        #[test]
        fn insertion_pushes_marks_at_the_insertion_row_down() {
            let mut marks = MarkRegistry::default();
            let id = marks.acquire(2);
            marks.splice(2, 2, 3);
            assert_eq!(marks.row_of(id), Some(5));
            assert_eq!(marks.acquire(5), id);
        }

        #[test]
        fn version_counts_non_empty_batches() {
            let mut doc = Document::from_text("t", "a\nb\n");
            doc.apply_hunks(Vec::new()).expect("noop");
            assert_eq!(doc.version(), 0);
            doc.apply_hunks(vec![Hunk::replace_line(1, "c")]).expect("apply");
            assert_eq!(doc.version(), 1);
            assert_eq!(doc.text(), "a\nc\n");
        }
    }
}

pub mod patch {
    //! Line-range hunks: normalization, bottom-up application and line diffs.

    use crate::core::PatchError;
    use crate::document::MarkRegistry;
    use serde::Serialize;
    use similar::{Algorithm, ChangeTag, TextDiff};

    /// Replace rows `start_row..end_row` with `new_lines`. `start_row == end_row` inserts.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Hunk {
        pub start_row: usize,
        pub end_row: usize,
        pub new_lines: Vec<String>,
    }

    impl Hunk {
        pub fn new(start_row: usize, end_row: usize, new_lines: Vec<String>) -> Self {
            Self {
                start_row,
                end_row,
                new_lines,
            }
        }

        pub fn replace_line(row: usize, line: impl Into<String>) -> Self {
            Self::new(row, row + 1, vec![line.into()])
        }

        pub fn insert(row: usize, lines: Vec<String>) -> Self {
            Self::new(row, row, lines)
        }

        pub fn delete(start_row: usize, end_row: usize) -> Self {
            Self::new(start_row, end_row, Vec::new())
        }
    }

    /// Sort by start row and reject anything that cannot be applied in a single pass.
    pub fn normalize(mut hunks: Vec<Hunk>, line_count: usize) -> Result<Vec<Hunk>, PatchError> {
        hunks.sort_by_key(|h| (h.start_row, h.end_row));
        for h in &hunks {
            if h.start_row > h.end_row {
                return Err(PatchError::Inverted {
                    start: h.start_row,
                    end: h.end_row,
                });
            }
            if h.end_row > line_count {
                return Err(PatchError::OutOfBounds {
                    start: h.start_row,
                    end: h.end_row,
                    len: line_count,
                });
            }
        }
        for pair in hunks.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.start_row < prev.end_row || next.start_row == prev.start_row {
                return Err(PatchError::Conflict {
                    first_start: prev.start_row,
                    first_end: prev.end_row,
                    second_start: next.start_row,
                    second_end: next.end_row,
                });
            }
        }
        Ok(hunks)
    }

    /// Apply all hunks in one pass, bottom-up, keeping marks in step.
    pub fn apply_hunks(
        lines: &mut Vec<String>,
        marks: &mut MarkRegistry,
        hunks: Vec<Hunk>,
    ) -> Result<(), PatchError> {
        let hunks = normalize(hunks, lines.len())?;
        for hunk in hunks.into_iter().rev() {
            marks.splice(hunk.start_row, hunk.end_row, hunk.new_lines.len());
            lines.splice(hunk.start_row..hunk.end_row, hunk.new_lines);
        }
        Ok(())
    }

    /// Minimal line-range hunks turning `old` into `new`.
    pub fn diff_lines(old: &[String], new: &[String]) -> Vec<Hunk> {
        if old == new {
            return Vec::new();
        }
        let old_refs: Vec<&str> = old.iter().map(String::as_str).collect();
        let new_refs: Vec<&str> = new.iter().map(String::as_str).collect();
        let diff = TextDiff::configure()
            .algorithm(Algorithm::Myers)
            .diff_slices(&old_refs, &new_refs);

        let mut hunks = Vec::new();
        let mut current: Option<Hunk> = None;
        let mut cursor = 0usize;
        for change in diff.iter_all_changes() {
            match change.tag() {
                ChangeTag::Equal => {
                    cursor += 1;
                    hunks.extend(current.take());
                }
                ChangeTag::Delete => {
                    let hunk = current.get_or_insert_with(|| Hunk::insert(cursor, Vec::new()));
                    cursor += 1;
                    hunk.end_row = cursor;
                }
                ChangeTag::Insert => {
                    current
                        .get_or_insert_with(|| Hunk::insert(cursor, Vec::new()))
                        .new_lines
                        .push(change.value().to_string());
                }
            }
        }
        hunks.extend(current);
        hunks
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn lines(xs: &[&str]) -> Vec<String> {
            xs.iter().map(|s| s.to_string()).collect()
        }

        #[test]
        fn hunks_apply_bottom_up_regardless_of_order() {
            let mut buf = lines(&["a", "b", "c", "d"]);
            let mut marks = MarkRegistry::default();
            let d = marks.acquire(3);
            let hunks = vec![
                Hunk::replace_line(2, "C"),
                Hunk::insert(0, lines(&["top"])),
                Hunk::delete(1, 2),
            ];
            apply_hunks(&mut buf, &mut marks, hunks).expect("apply");
            assert_eq!(buf, lines(&["top", "a", "C", "d"]));
            assert_eq!(marks.row_of(d), Some(3));
        }

        #[test]
        fn overlapping_hunks_conflict() {
            let mut buf = lines(&["a", "b", "c"]);
            let mut marks = MarkRegistry::default();
            let err = apply_hunks(
                &mut buf,
                &mut marks,
                vec![Hunk::new(0, 2, vec![]), Hunk::replace_line(1, "x")],
            )
            .expect_err("conflict");
            assert!(matches!(err, PatchError::Conflict { .. }));
            assert_eq!(buf, lines(&["a", "b", "c"]));

            let err = normalize(vec![Hunk::insert(1, vec![]), Hunk::replace_line(1, "x")], 3)
                .expect_err("same start");
            assert!(matches!(err, PatchError::Conflict { .. }));
        }

        #[test]
        fn out_of_range_and_inverted_hunks_are_rejected() {
            assert!(matches!(
                normalize(vec![Hunk::delete(2, 5)], 3),
                Err(PatchError::OutOfBounds { len: 3, .. })
            ));
            assert!(matches!(
                normalize(vec![Hunk::new(2, 1, vec![])], 3),
                Err(PatchError::Inverted { .. })
            ));
            normalize(Vec::new(), 0).expect("empty is fine");
        }

        #[test]
        fn diff_merges_adjacent_changes() {
            let old = lines(&["a", "b", "c", "d", "e"]);
            let new = lines(&["a", "B", "C", "d", "e", "f"]);
            let hunks = diff_lines(&old, &new);
            assert_eq!(
                hunks,
                vec![
                    Hunk::new(1, 3, lines(&["B", "C"])),
                    Hunk::insert(5, lines(&["f"])),
                ]
            );

            let mut buf = old.clone();
            apply_hunks(&mut buf, &mut MarkRegistry::default(), hunks).expect("apply");
            assert_eq!(buf, new);
            assert!(diff_lines(&new, &new).is_empty());
        }
    }
}

pub mod todo_map {
    //! Snapshot of the todos in one document: an id-keyed map with id-only references.

    use crate::classify::TodoClassifier;
    use crate::core::{NodeId, Position, Range, TodoId, TodoItem, TodoMarker};
    use crate::discovery::discover_list_items;
    use crate::document::MarkRegistry;
    use crate::metadata::MetadataExtractor;
    use crate::syntax::SyntaxTree;
    use std::collections::{HashMap, HashSet};

    #[derive(Debug, Clone, Default)]
    pub struct TodoMap {
        items: HashMap<TodoId, TodoItem>,
    }

    impl TodoMap {
        pub fn get(&self, id: TodoId) -> Option<&TodoItem> {
            self.items.get(&id)
        }

        pub fn contains(&self, id: TodoId) -> bool {
            self.items.contains_key(&id)
        }

        pub fn len(&self) -> usize {
            self.items.len()
        }

        pub fn is_empty(&self) -> bool {
            self.items.is_empty()
        }

        /// Unordered.
        pub fn iter(&self) -> impl Iterator<Item = &TodoItem> + '_ {
            self.items.values()
        }

        pub fn in_document_order(&self) -> Vec<&TodoItem> {
            let mut items: Vec<&TodoItem> = self.items.values().collect();
            items.sort_by_key(|item| item.range.start);
            items
        }

        /// Innermost todo covering `pos`.
        pub fn item_at(&self, pos: Position) -> Option<&TodoItem> {
            self.items
                .values()
                .filter(|item| item.covers(pos))
                .max_by_key(|item| item.range.start)
        }

        /// Todo whose glyph sits on `row`.
        pub fn item_on_row(&self, row: usize) -> Option<&TodoItem> {
            self.items.values().find(|item| item.marker.position.row == row)
        }

        pub fn roots(&self) -> Vec<&TodoItem> {
            self.in_document_order()
                .into_iter()
                .filter(|item| item.parent_id.is_none())
                .collect()
        }

        /// All todo descendants of `id`, depth-first in document order.
        pub fn descendants(&self, id: TodoId) -> Vec<TodoId> {
            let mut out = Vec::new();
            let mut stack: Vec<TodoId> = match self.get(id) {
                Some(item) => item.children.iter().rev().copied().collect(),
                None => return out,
            };
            while let Some(next) = stack.pop() {
                out.push(next);
                if let Some(item) = self.get(next) {
                    stack.extend(item.children.iter().rev().copied());
                }
            }
            out
        }
    }

    pub struct TodoMapBuilder<'a> {
        classifier: &'a TodoClassifier,
        extractor: &'a MetadataExtractor,
    }

    impl<'a> TodoMapBuilder<'a> {
        pub fn new(classifier: &'a TodoClassifier, extractor: &'a MetadataExtractor) -> Self {
            Self {
                classifier,
                extractor,
            }
        }

        /// Claims a mark per todo row and prunes marks no todo claimed.
        pub fn build(
            &self,
            lines: &[String],
            tree: &SyntaxTree,
            marks: &mut MarkRegistry,
        ) -> TodoMap {
            let list_items = discover_list_items(tree, lines);
            let mut ids_by_node: HashMap<NodeId, TodoId> = HashMap::new();
            let mut todos: Vec<TodoItem> = Vec::new();

            for item in &list_items {
                let row = item.marker_range.start.row;
                let Some(line) = lines.get(row) else {
                    continue;
                };
                let Some(found) = self.classifier.classify(line) else {
                    continue;
                };

                let id = marks.acquire(row);
                let inline_start = Position::new(row, found.content_col);
                let inline_end = tree
                    .first_paragraph_of(item.node)
                    .map(|p| p.range.end)
                    .unwrap_or(Position::new(row, line.len()))
                    .max(inline_start);
                let first_inline_range = Range::new(inline_start, inline_end);

                ids_by_node.insert(item.node, id);
                todos.push(TodoItem {
                    id,
                    state: found.state,
                    range: item.range,
                    marker: TodoMarker {
                        text: found.glyph,
                        position: Position::new(row, found.glyph_col),
                    },
                    list_marker: item.list_marker.clone(),
                    parent_id: None,
                    children: Vec::new(),
                    text: line.get(found.content_col..).unwrap_or_default().to_string(),
                    first_inline_range,
                    metadata: self.extractor.extract(lines, first_inline_range),
                    node: item.node,
                });
            }

            // Logical parent skips non-todo list items.
            let structural_parent: HashMap<NodeId, Option<NodeId>> =
                list_items.iter().map(|li| (li.node, li.parent)).collect();
            for todo in &mut todos {
                let mut cursor = structural_parent.get(&todo.node).copied().flatten();
                while let Some(node) = cursor {
                    if let Some(id) = ids_by_node.get(&node) {
                        todo.parent_id = Some(*id);
                        break;
                    }
                    cursor = structural_parent.get(&node).copied().flatten();
                }
            }

            let mut children: HashMap<TodoId, Vec<TodoId>> = HashMap::new();
            for todo in &todos {
                if let Some(parent) = todo.parent_id {
                    children.entry(parent).or_default().push(todo.id);
                }
            }
            for todo in &mut todos {
                todo.children = children.remove(&todo.id).unwrap_or_default();
            }

            let claimed: HashSet<TodoId> = todos.iter().map(|t| t.id).collect();
            marks.retain(&claimed);
            tracing::debug!(list_items = list_items.len(), todos = todos.len(), "built todo map");

            TodoMap {
                items: todos.into_iter().map(|t| (t.id, t)).collect(),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::config::Config;
        use crate::syntax::{MarkdownListParser, StructuralParser};

        fn build(text: &str, marks: &mut MarkRegistry) -> TodoMap {
            let config = Config::default();
            let lines: Vec<String> = text.lines().map(str::to_string).collect();
            let tree = MarkdownListParser.parse(&lines);
            let classifier = TodoClassifier::new(&config);
            let extractor = MetadataExtractor::new(&config);
            TodoMapBuilder::new(&classifier, &extractor).build(&lines, &tree, marks)
        }

        const NESTED: &str = "\
- ☐ parent @priority(high)
  continued @owner(me)
  - plain group
    - ✔ grandchild
  - ☐ child
- ☐ sibling";

        #[test]
        fn hierarchy_skips_plain_list_items() {
            let mut marks = MarkRegistry::default();
            let map = build(NESTED, &mut marks);
            assert_eq!(map.len(), 4);

            let parent = map.item_on_row(0).expect("parent");
            let grandchild = map.item_on_row(3).expect("grandchild");
            let child = map.item_on_row(4).expect("child");
            assert_eq!(parent.children, vec![grandchild.id, child.id]);
            assert_eq!(grandchild.parent_id, Some(parent.id));
            assert_eq!(grandchild.state, "checked");
            assert_eq!(map.roots().len(), 2);
            assert_eq!(map.descendants(parent.id), vec![grandchild.id, child.id]);
            assert_eq!(marks.len(), 4);
        }

        #[test]
        fn inline_range_includes_paragraph_continuation() {
            let mut marks = MarkRegistry::default();
            let map = build(NESTED, &mut marks);
            let parent = map.item_on_row(0).expect("parent");
            assert_eq!(parent.text, "parent @priority(high)");
            assert_eq!(parent.first_inline_range.end.row, 1);
            assert_eq!(parent.metadata.len(), 2);
            assert_eq!(parent.metadata.get("owner").map(|e| e.value.as_str()), Some("me"));
            assert_eq!(parent.range.end.row, 4);
        }

        #[test]
        fn item_at_prefers_the_innermost_todo() {
            let mut marks = MarkRegistry::default();
            let map = build(NESTED, &mut marks);
            let parent = map.item_on_row(0).expect("parent").id;
            let child = map.item_on_row(4).expect("child").id;

            assert_eq!(map.item_at(Position::new(1, 0)).map(|t| t.id), Some(parent));
            assert_eq!(map.item_at(Position::new(4, 0)).map(|t| t.id), Some(child));
            assert_eq!(map.item_at(Position::new(2, 3)).map(|t| t.id), Some(parent));
            assert!(map.item_at(Position::new(9, 0)).is_none());
        }

        #[test]
        fn ids_follow_marks_and_unclaimed_marks_are_pruned() {
            let mut marks = MarkRegistry::default();
            let first = build("- ☐ a\n- ☐ b", &mut marks);
            let b = first.item_on_row(1).expect("b").id;
            let stray = marks.acquire(7);

            let second = build("- ☐ a\n- ☐ b", &mut marks);
            assert_eq!(second.item_on_row(1).map(|t| t.id), Some(b));
            assert_eq!(marks.row_of(stray), None);
        }
    }
}

pub mod convert {
    //! Portable `[ ]`/`[x]` checkboxes ↔ canonical glyphs. Line count never changes.

    use crate::classify::TodoClassifier;
    use crate::config::Config;
    use crate::syntax::list_prefix;
    use nom::{
        IResult,
        character::complete::{anychar, char},
        error::VerboseError,
        sequence::{delimited, preceded},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// ` [c]` right after the list marker.
    fn checkbox(i: &str) -> PResult<'_, char> {
        preceded(char(' '), delimited(char('['), anychar, char(']')))(i)
    }

    pub fn markdown_line_to_unicode(line: &str, config: &Config) -> Option<String> {
        let (rest, _) = list_prefix(line).ok()?;
        let (tail, ch) = checkbox(rest).ok()?;
        if !(tail.is_empty() || tail.starts_with(' ')) {
            return None;
        }
        let glyph = config.marker_for(config.state_for_markdown(ch)?)?;
        let head = &line[..line.len() - rest.len()];
        Some(format!("{head} {glyph}{tail}"))
    }

    pub fn unicode_line_to_markdown(
        line: &str,
        classifier: &TodoClassifier,
        config: &Config,
    ) -> Option<String> {
        let found = classifier.classify(line)?;
        let ch = config.markdown_for(&found.state)?;
        let head = &line[..found.glyph_col];
        let tail = &line[found.glyph_col + found.glyph.len()..];
        Some(format!("{head}[{ch}]{tail}"))
    }

    pub fn markdown_to_unicode(lines: &mut [String], config: &Config) -> bool {
        convert_lines(lines, |line| markdown_line_to_unicode(line, config))
    }

    pub fn unicode_to_markdown(lines: &mut [String], config: &Config) -> bool {
        let classifier = TodoClassifier::new(config);
        convert_lines(lines, |line| unicode_line_to_markdown(line, &classifier, config))
    }

    fn convert_lines(lines: &mut [String], convert: impl Fn(&str) -> Option<String>) -> bool {
        let mut changed = false;
        for line in lines.iter_mut() {
            if let Some(converted) = convert(line) {
                if *line != converted {
                    *line = converted;
                    changed = true;
                }
            }
        }
        changed
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::config::{StateKind, TodoStateConfig};

        fn lines(text: &str) -> Vec<String> {
            text.lines().map(str::to_string).collect()
        }

        const PORTABLE: &str = "\
# Plan
- [ ] write docs
  1. [x] nested done
- [x]
- plain item
- [ ]no space
* [?] unknown
text [ ] in prose";

        #[test]
        fn round_trip_is_identity_and_keeps_line_count() {
            let config = Config::default();
            let original = lines(PORTABLE);
            let mut buf = original.clone();

            assert!(markdown_to_unicode(&mut buf, &config));
            assert_eq!(buf.len(), original.len());
            assert_eq!(buf[1], "- ☐ write docs");
            assert_eq!(buf[2], "  1. ✔ nested done");
            assert_eq!(buf[3], "- ✔");
            assert_eq!(&buf[4..], &original[4..]);

            assert!(unicode_to_markdown(&mut buf, &config));
            assert_eq!(buf, original);
        }

        #[test]
        fn uppercase_x_normalizes_to_lowercase() {
            let config = Config::default();
            let mut buf = lines("- [X] shout");
            markdown_to_unicode(&mut buf, &config);
            assert_eq!(buf[0], "- ✔ shout");
            unicode_to_markdown(&mut buf, &config);
            assert_eq!(buf[0], "- [x] shout");
        }

        #[test]
        fn custom_states_convert_both_ways() {
            let mut config = Config::default();
            config.todo_states.insert(
                "in_progress".into(),
                TodoStateConfig {
                    marker: "◐".into(),
                    markdown: '-',
                    kind: StateKind::Incomplete,
                },
            );
            let mut buf = lines("- [-] halfway");
            assert!(markdown_to_unicode(&mut buf, &config));
            assert_eq!(buf[0], "- ◐ halfway");
            assert!(unicode_to_markdown(&mut buf, &config));
            assert_eq!(buf[0], "- [-] halfway");
        }

        #[test]
        fn nothing_to_convert_reports_no_change() {
            let config = Config::default();
            let mut buf = lines("- ☐ already canonical\n- plain");
            assert!(!markdown_to_unicode(&mut buf, &config));
        }
    }
}

pub mod ops {
    //! Operations compute hunks against a snapshot of the document; they never edit it directly.

    use crate::config::{CHECKED, Config, UNCHECKED, is_valid_tag_name};
    use crate::core::{DocumentId, MetadataEntry, TodoId, TodoItem};
    use crate::engine::TxContext;
    use crate::metadata::{default_value, is_balanced_value};
    use crate::patch::Hunk;
    use crate::syntax::list_item_start;
    use crate::todo_map::TodoMap;
    use anyhow::{Context, Result, anyhow, bail};
    use serde::Serialize;
    use std::{collections::BTreeMap, fmt};

    /// Dedup key: operation identity plus its arguments.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
    pub struct OpKey {
        pub name: String,
        pub args: Vec<String>,
    }

    impl OpKey {
        pub fn new<I, S>(name: impl Into<String>, args: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                name: name.into(),
                args: args.into_iter().map(Into::into).collect(),
            }
        }
    }

    impl fmt::Display for OpKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}({})", self.name, self.args.join(", "))
        }
    }

    pub type Callback = Box<dyn FnOnce(&mut TxContext<'_>) -> Result<()>>;

    /// What an operation sees while its batch is applied.
    pub struct OpContext<'a> {
        document: DocumentId,
        lines: &'a [String],
        todos: &'a TodoMap,
        config: &'a Config,
        callbacks: &'a mut Vec<Callback>,
    }

    impl<'a> OpContext<'a> {
        pub(crate) fn new(
            document: DocumentId,
            lines: &'a [String],
            todos: &'a TodoMap,
            config: &'a Config,
            callbacks: &'a mut Vec<Callback>,
        ) -> Self {
            Self {
                document,
                lines,
                todos,
                config,
                callbacks,
            }
        }

        pub fn document_id(&self) -> DocumentId {
            self.document
        }

        pub fn lines(&self) -> &'a [String] {
            self.lines
        }

        pub fn line(&self, row: usize) -> Result<&'a str> {
            self.lines
                .get(row)
                .map(String::as_str)
                .with_context(|| format!("row {row} is outside the document"))
        }

        pub fn todo_map(&self) -> &'a TodoMap {
            self.todos
        }

        pub fn todo(&self, id: TodoId) -> Result<&'a TodoItem> {
            self.todos.get(id).ok_or_else(|| anyhow!("unknown todo {id}"))
        }

        pub fn config(&self) -> &'a Config {
            self.config
        }

        /// Micro callback: runs after this batch, before callbacks already queued.
        pub fn add_cb(&mut self, f: impl FnOnce(&mut TxContext<'_>) -> Result<()> + 'static) {
            self.callbacks.push(Box::new(f));
        }
    }

    pub trait Operation {
        fn key(&self) -> OpKey;
        fn apply(&self, cx: &mut OpContext<'_>) -> Result<Vec<Hunk>>;
    }

    /* ------------------------------ State ------------------------------ */

    #[derive(Debug, Clone)]
    pub struct SetState {
        pub id: TodoId,
        pub state: String,
    }

    impl SetState {
        pub fn new(id: TodoId, state: impl Into<String>) -> Self {
            Self {
                id,
                state: state.into(),
            }
        }
    }

    impl Operation for SetState {
        fn key(&self) -> OpKey {
            OpKey::new("set_state", [self.id.to_string(), self.state.clone()])
        }

        fn apply(&self, cx: &mut OpContext<'_>) -> Result<Vec<Hunk>> {
            rewrite_glyph(cx, self.id, &self.state)
        }
    }

    /// `checked` ↔ `unchecked`; any other state goes to `checked`.
    #[derive(Debug, Clone)]
    pub struct Toggle {
        pub id: TodoId,
    }

    impl Operation for Toggle {
        fn key(&self) -> OpKey {
            OpKey::new("toggle", [self.id.to_string()])
        }

        fn apply(&self, cx: &mut OpContext<'_>) -> Result<Vec<Hunk>> {
            let todo = cx.todo(self.id)?;
            let target = cx.config().toggle_target(&todo.state);
            rewrite_glyph(cx, self.id, target)
        }
    }

    fn rewrite_glyph(cx: &OpContext<'_>, id: TodoId, state: &str) -> Result<Vec<Hunk>> {
        let todo = cx.todo(id)?;
        if todo.state == state {
            return Ok(Vec::new());
        }
        let glyph = cx
            .config()
            .marker_for(state)
            .with_context(|| format!("unknown todo state `{state}`"))?;
        let position = todo.marker.position;
        let line = cx.line(position.row)?;
        let end = position.col + todo.marker.text.len();
        let (Some(head), Some(tail)) = (line.get(..position.col), line.get(end..)) else {
            bail!("glyph of todo {id} no longer matches row {}", position.row);
        };
        Ok(vec![Hunk::replace_line(position.row, format!("{head}{glyph}{tail}"))])
    }

    /* ----------------------------- Metadata ----------------------------- */

    /// Set a tag's value, replacing the last occurrence of the tag or any of its aliases.
    #[derive(Debug, Clone)]
    pub struct AddMetadata {
        pub id: TodoId,
        pub tag: String,
        /// `None` uses the tag's configured default.
        pub value: Option<String>,
    }

    impl Operation for AddMetadata {
        fn key(&self) -> OpKey {
            OpKey::new(
                "add_metadata",
                [self.id.to_string(), self.tag.clone(), format!("{:?}", self.value)],
            )
        }

        fn apply(&self, cx: &mut OpContext<'_>) -> Result<Vec<Hunk>> {
            if !is_valid_tag_name(&self.tag) {
                bail!("invalid metadata tag `{}`", self.tag);
            }
            let config = cx.config();
            let value = match &self.value {
                Some(value) => value.clone(),
                None => default_value(config, &self.tag),
            };
            if value.contains('\n') || !is_balanced_value(&value) {
                bail!("metadata value {value:?} must be a single line with balanced parentheses");
            }

            let todo = cx.todo(self.id)?;
            let canonical = config.canonical_tag(&self.tag).unwrap_or(&self.tag);
            let existing = todo
                .metadata
                .entries
                .iter()
                .rev()
                .find(|entry| matches_tag(entry, &self.tag, canonical));

            let hunk = match existing {
                Some(entry) => {
                    let span = entry.value_range;
                    let line = cx.line(span.start.row)?;
                    let head = line.get(..span.start.col).unwrap_or(line);
                    let tail = line.get(span.end.col..).unwrap_or_default();
                    Hunk::replace_line(span.start.row, format!("{head}{value}{tail}"))
                }
                None => {
                    let end = todo.first_inline_range.end;
                    let line = cx.line(end.row)?;
                    let (head, tail) = line.split_at(end.col.min(line.len()));
                    let sep = if head.is_empty() || head.ends_with(' ') { "" } else { " " };
                    Hunk::replace_line(end.row, format!("{head}{sep}@{}({value}){tail}", self.tag))
                }
            };
            Ok(vec![hunk])
        }
    }

    /// Remove every occurrence of a tag and its aliases, with one preceding space each.
    #[derive(Debug, Clone)]
    pub struct RemoveMetadata {
        pub id: TodoId,
        pub tag: String,
    }

    impl Operation for RemoveMetadata {
        fn key(&self) -> OpKey {
            OpKey::new("remove_metadata", [self.id.to_string(), self.tag.clone()])
        }

        fn apply(&self, cx: &mut OpContext<'_>) -> Result<Vec<Hunk>> {
            let todo = cx.todo(self.id)?;
            let canonical = cx.config().canonical_tag(&self.tag).unwrap_or(&self.tag);

            let mut by_row: BTreeMap<usize, Vec<&MetadataEntry>> = BTreeMap::new();
            for entry in &todo.metadata.entries {
                if matches_tag(entry, &self.tag, canonical) {
                    by_row.entry(entry.range.start.row).or_default().push(entry);
                }
            }

            let mut hunks = Vec::with_capacity(by_row.len());
            for (row, entries) in by_row {
                let mut line = cx.line(row)?.to_string();
                // Right to left so earlier columns stay valid.
                for entry in entries.iter().rev() {
                    let mut start = entry.range.start.col;
                    if line[..start].ends_with(' ') {
                        start -= 1;
                    }
                    line.replace_range(start..entry.range.end.col, "");
                }
                hunks.push(Hunk::replace_line(row, line));
            }
            Ok(hunks)
        }
    }

    fn matches_tag(entry: &MetadataEntry, tag: &str, canonical: &str) -> bool {
        entry.tag == tag || entry.canonical_tag() == canonical
    }

    /* ------------------------- Create / remove ------------------------- */

    /// Turn the line at `row` into an unchecked todo.
    #[derive(Debug, Clone)]
    pub struct CreateTodo {
        pub row: usize,
    }

    impl Operation for CreateTodo {
        fn key(&self) -> OpKey {
            OpKey::new("create_todo", [self.row.to_string()])
        }

        fn apply(&self, cx: &mut OpContext<'_>) -> Result<Vec<Hunk>> {
            if cx.todo_map().item_on_row(self.row).is_some() {
                return Ok(Vec::new());
            }
            let config = cx.config();
            let glyph = config
                .marker_for(UNCHECKED)
                .context("no unchecked state configured")?;
            let line = cx.line(self.row)?;

            let (head, text) = match list_item_start(line) {
                Some((prefix, rest)) => (
                    line[..prefix.indent.len() + prefix.marker.len()].to_string(),
                    rest.trim_start(),
                ),
                None => {
                    let text = line.trim_start();
                    let indent = &line[..line.len() - text.len()];
                    (format!("{indent}{}", config.list_style.default_marker), text)
                }
            };
            let updated = if text.is_empty() {
                format!("{head} {glyph}")
            } else {
                format!("{head} {glyph} {text}")
            };
            Ok(vec![Hunk::replace_line(self.row, updated)])
        }
    }

    /// Drop the glyph, leaving a plain list item.
    #[derive(Debug, Clone)]
    pub struct RemoveTodo {
        pub id: TodoId,
    }

    impl Operation for RemoveTodo {
        fn key(&self) -> OpKey {
            OpKey::new("remove_todo", [self.id.to_string()])
        }

        fn apply(&self, cx: &mut OpContext<'_>) -> Result<Vec<Hunk>> {
            let todo = cx.todo(self.id)?;
            let position = todo.marker.position;
            let line = cx.line(position.row)?;
            let end = position.col + todo.marker.text.len();
            let (Some(head), Some(tail)) = (line.get(..position.col), line.get(end..)) else {
                bail!("glyph of todo {} no longer matches row {}", self.id, position.row);
            };
            let updated = match tail.strip_prefix(' ') {
                Some(text) => format!("{head}{text}"),
                None => format!("{}{tail}", head.trim_end()),
            };
            Ok(vec![Hunk::replace_line(position.row, updated)])
        }
    }

    /* ------------------------------ Closures ------------------------------ */

    /// Ad-hoc operation. Two `FnOp`s with the same name and args are the same operation.
    pub struct FnOp<F> {
        name: String,
        args: Vec<String>,
        f: F,
    }

    impl<F> FnOp<F>
    where
        F: Fn(&mut OpContext<'_>, &[String]) -> Result<Vec<Hunk>>,
    {
        pub fn new(name: impl Into<String>, args: Vec<String>, f: F) -> Self {
            Self {
                name: name.into(),
                args,
                f,
            }
        }
    }

    impl<F> Operation for FnOp<F>
    where
        F: Fn(&mut OpContext<'_>, &[String]) -> Result<Vec<Hunk>>,
    {
        fn key(&self) -> OpKey {
            OpKey::new(self.name.clone(), self.args.iter().cloned())
        }

        fn apply(&self, cx: &mut OpContext<'_>) -> Result<Vec<Hunk>> {
            (self.f)(cx, &self.args)
        }
    }

    /* ---------------------------- Smart toggle ---------------------------- */

    /// Queue a state change plus the propagation `smart_toggle` asks for.
    pub fn queue_state_change(tx: &mut TxContext<'_>, id: TodoId, target: &str) {
        tx.add_op(SetState::new(id, target));

        let smart = tx.config().smart_toggle.clone();
        if !smart.enabled {
            return;
        }
        let completing = tx.config().is_complete(target);

        if completing && smart.check_down {
            let map = tx.get_todo_map();
            let config = tx.config();
            let pending: Vec<TodoId> = map
                .descendants(id)
                .into_iter()
                .filter(|d| map.get(*d).is_some_and(|t| config.is_incomplete(&t.state)))
                .collect();
            for descendant in pending {
                tx.add_op(SetState::new(descendant, target));
            }
        }

        if (completing && smart.check_up) || (!completing && smart.uncheck_up) {
            tx.add_cb(move |tx| propagate_up(tx, id));
        }
    }

    /// Completes a parent whose children are all done, or reopens a completed parent.
    fn propagate_up(tx: &mut TxContext<'_>, id: TodoId) -> Result<()> {
        let map = tx.get_todo_map();
        let config = tx.config();
        let Some(parent_id) = map.get(id).and_then(|todo| todo.parent_id) else {
            return Ok(());
        };
        let parent = map
            .get(parent_id)
            .with_context(|| format!("parent {parent_id} missing from todo map"))?;

        let children_done = parent
            .children
            .iter()
            .filter_map(|child| map.get(*child))
            .all(|child| !config.is_incomplete(&child.state));
        let parent_done = config.is_complete(&parent.state);

        let target = if children_done && !parent_done && config.smart_toggle.check_up {
            CHECKED
        } else if !children_done && parent_done && config.smart_toggle.uncheck_up {
            UNCHECKED
        } else {
            return Ok(());
        };
        tx.add_op(SetState::new(parent_id, target));
        tx.add_cb(move |tx| propagate_up(tx, parent_id));
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::DocumentId;
        use crate::engine::TodoEngine;

        fn open(text: &str) -> (TodoEngine, DocumentId) {
            let engine = TodoEngine::default();
            let doc = engine.open_document("ops.md", text);
            (engine, doc)
        }

        fn id_on_row(engine: &TodoEngine, doc: DocumentId, row: usize) -> TodoId {
            engine
                .discover(doc)
                .expect("discover")
                .item_on_row(row)
                .expect("todo on row")
                .id
        }

        fn text(engine: &TodoEngine, doc: DocumentId) -> String {
            engine.document_text(doc).expect("text")
        }

        /// Run `op` against the current snapshot without applying anything.
        fn hunks_for(
            engine: &TodoEngine,
            doc: DocumentId,
            op: &dyn Operation,
        ) -> Result<Vec<Hunk>> {
            let todos = engine.discover(doc).expect("discover");
            let lines = engine.lines(doc).expect("lines");
            let mut callbacks = Vec::new();
            let mut cx = OpContext::new(doc, &lines, &todos, engine.config(), &mut callbacks);
            op.apply(&mut cx)
        }

        #[test]
        fn keys_identify_name_and_args() {
            let id = TodoId::new();
            assert_eq!(Toggle { id }.key(), Toggle { id }.key());
            assert_ne!(
                SetState::new(id, CHECKED).key(),
                SetState::new(id, UNCHECKED).key()
            );
            let key = OpKey::new("f", ["foo", "bar"]);
            assert_eq!(key.to_string(), "f(foo, bar)");
        }

        #[test]
        fn setting_the_current_state_produces_no_hunks() {
            let (engine, doc) = open("- ☐ a");
            let id = id_on_row(&engine, doc, 0);
            let hunks = hunks_for(&engine, doc, &SetState::new(id, UNCHECKED)).expect("apply");
            assert!(hunks.is_empty());

            let hunks = hunks_for(&engine, doc, &SetState::new(id, CHECKED)).expect("apply");
            assert_eq!(hunks, vec![Hunk::replace_line(0, "- ✔ a")]);
        }

        #[test]
        fn unknown_state_is_an_op_error() {
            let (engine, doc) = open("- ☐ a");
            let id = id_on_row(&engine, doc, 0);
            let err = hunks_for(&engine, doc, &SetState::new(id, "later")).expect_err("unknown");
            assert!(err.to_string().contains("later"));
        }

        #[test]
        fn add_metadata_replaces_through_aliases() {
            let (engine, doc) = open("- ☐ ship it @completed(someday) @priority(low)");
            let id = id_on_row(&engine, doc, 0);
            engine
                .add_metadata(doc, id, "done", Some("2024-05-01"))
                .expect("add");
            assert_eq!(
                text(&engine, doc),
                "- ☐ ship it @completed(2024-05-01) @priority(low)"
            );
        }

        #[test]
        fn add_metadata_appends_after_continuation_lines() {
            let (engine, doc) = open("- ☐ ship it\n  across lines\n- ☐ next");
            let id = id_on_row(&engine, doc, 0);
            let report = engine.add_metadata(doc, id, "priority", None).expect("add");
            assert!(report.is_clean());
            assert_eq!(
                text(&engine, doc),
                "- ☐ ship it\n  across lines @priority(medium)\n- ☐ next"
            );
            let todo = engine
                .get_todo_by_id(doc, id)
                .expect("lookup")
                .expect("todo");
            assert_eq!(
                todo.metadata.get("priority").map(|e| e.value.as_str()),
                Some("medium")
            );
        }

        #[test]
        fn unbalanced_values_are_reported_not_written() {
            let (engine, doc) = open("- ☐ a");
            let id = id_on_row(&engine, doc, 0);
            let report = engine.add_metadata(doc, id, "note", Some("a(b")).expect("run");
            assert_eq!(report.op_failures.len(), 1);
            assert_eq!(text(&engine, doc), "- ☐ a");
        }

        #[test]
        fn remove_metadata_drops_every_alias() {
            let (engine, doc) = open("- ☐ task @done(x) mid @finished(y)");
            let id = id_on_row(&engine, doc, 0);
            engine.remove_metadata(doc, id, "completed").expect("remove");
            assert_eq!(text(&engine, doc), "- ☐ task mid");
        }

        #[test]
        fn create_todo_on_plain_lines_and_list_items() {
            let (engine, doc) = open("buy milk\n  * item\n- ☐ already");
            engine.create_todo(doc, 0).expect("plain line");
            engine.create_todo(doc, 1).expect("list item");
            let report = engine.create_todo(doc, 2).expect("existing todo");
            assert!(report.is_clean());
            assert_eq!(text(&engine, doc), "- ☐ buy milk\n  * ☐ item\n- ☐ already");
            assert_eq!(engine.discover(doc).expect("discover").len(), 3);
        }

        #[test]
        fn remove_todo_keeps_the_list_item() {
            let (engine, doc) = open("- ☐ task\n- ✔");
            let first = id_on_row(&engine, doc, 0);
            let second = id_on_row(&engine, doc, 1);
            engine.remove_todo(doc, first).expect("first");
            engine.remove_todo(doc, second).expect("second");
            assert_eq!(text(&engine, doc), "- task\n-");
            assert!(engine.discover(doc).expect("discover").is_empty());
        }

        #[test]
        fn smart_toggle_skips_inactive_children() {
            let mut config = Config::default();
            config.todo_states.insert(
                "cancelled".into(),
                crate::config::TodoStateConfig {
                    marker: "✘".into(),
                    markdown: '-',
                    kind: crate::config::StateKind::Inactive,
                },
            );
            let engine = TodoEngine::new(config).expect("config");
            let doc = engine.open_document("ops.md", "- ☐ parent\n  - ✘ dropped\n  - ☐ real");
            let real = id_on_row(&engine, doc, 2);
            engine.toggle(doc, real).expect("toggle");
            assert_eq!(
                text(&engine, doc),
                "- ✔ parent\n  - ✘ dropped\n  - ✔ real"
            );

            let parent = id_on_row(&engine, doc, 0);
            engine.toggle(doc, parent).expect("reopen parent");
            assert_eq!(
                text(&engine, doc),
                "- ☐ parent\n  - ✘ dropped\n  - ✔ real"
            );
        }
    }
}

pub mod engine {
    //! Documents, discovery and transactions.
    //!
    //! A transaction moves its document through Collecting → Applying → Draining → Idle.
    //! Queued work lives on an explicit stack of frames. Each frame holds the ops and callbacks
    //! queued at one level; work queued by a callback becomes a child frame that is fully
    //! drained before the callback's siblings run.

    use crate::classify::TodoClassifier;
    use crate::config::Config;
    use crate::convert::{markdown_to_unicode, unicode_to_markdown};
    use crate::core::{DocumentId, EngineError, MetadataSet, Position, Range, TodoId, TodoItem};
    use crate::document::Document;
    use crate::metadata::{
        ChoiceContext, Completion, MetadataExtractor, ValueProvider, request_choices,
    };
    use crate::ops::{
        self, AddMetadata, Callback, CreateTodo, FnOp, OpContext, OpKey, Operation,
        RemoveMetadata, RemoveTodo, SetState,
    };
    use crate::patch::{Hunk, diff_lines};
    use crate::syntax::{MarkdownListParser, StructuralParser};
    use crate::todo_map::{TodoMap, TodoMapBuilder};
    use serde::Serialize;
    use std::{
        cell::{Cell, RefCell},
        collections::{HashMap, HashSet, VecDeque},
        fs,
        path::Path,
        rc::Rc,
    };

    /* ------------------------------ Phases ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    pub enum TxPhase {
        Idle,
        Collecting,
        Applying,
        Draining,
    }

    /// Active transactions by document. A document absent from the map is idle.
    #[derive(Debug, Default)]
    pub struct TransactionRegistry {
        phases: RefCell<HashMap<DocumentId, TxPhase>>,
    }

    impl TransactionRegistry {
        pub fn phase(&self, document: DocumentId) -> TxPhase {
            self.phases
                .borrow()
                .get(&document)
                .copied()
                .unwrap_or(TxPhase::Idle)
        }

        fn begin(&self, document: DocumentId, name: &str) -> Result<PhaseGuard<'_>, EngineError> {
            let mut phases = self.phases.borrow_mut();
            if phases.contains_key(&document) {
                return Err(EngineError::Reentrancy {
                    document,
                    name: name.to_string(),
                });
            }
            phases.insert(document, TxPhase::Collecting);
            Ok(PhaseGuard {
                registry: self,
                document,
            })
        }
    }

    /// Returns the document to Idle when dropped, including on early error returns.
    struct PhaseGuard<'a> {
        registry: &'a TransactionRegistry,
        document: DocumentId,
    }

    impl PhaseGuard<'_> {
        fn enter(&self, phase: TxPhase) {
            self.registry
                .phases
                .borrow_mut()
                .insert(self.document, phase);
        }
    }

    impl Drop for PhaseGuard<'_> {
        fn drop(&mut self) {
            self.registry.phases.borrow_mut().remove(&self.document);
        }
    }

    /* ------------------------------ Reports ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct OpFailure {
        pub key: OpKey,
        pub error: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct CallbackFailure {
        /// Frame depth the callback ran at; 1 is the transaction body's level.
        pub depth: usize,
        pub error: String,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct TransactionReport {
        /// Calls into the patch applier, one per applied batch.
        pub patch_calls: usize,
        pub ops_applied: usize,
        pub op_failures: Vec<OpFailure>,
        pub callback_failures: Vec<CallbackFailure>,
    }

    impl TransactionReport {
        pub fn is_clean(&self) -> bool {
            self.op_failures.is_empty() && self.callback_failures.is_empty()
        }
    }

    /* ------------------------------ Context ------------------------------ */

    #[derive(Default)]
    struct Frame {
        ops: Vec<Box<dyn Operation>>,
        seen: HashSet<OpKey>,
        callbacks: VecDeque<Callback>,
    }

    impl Frame {
        fn is_empty(&self) -> bool {
            self.ops.is_empty() && self.callbacks.is_empty()
        }
    }

    /// Handed to transaction bodies and callbacks.
    pub struct TxContext<'a> {
        engine: &'a TodoEngine,
        document: DocumentId,
        todos: &'a TodoMap,
        frame: &'a mut Frame,
    }

    impl<'a> TxContext<'a> {
        fn new(
            engine: &'a TodoEngine,
            document: DocumentId,
            todos: &'a TodoMap,
            frame: &'a mut Frame,
        ) -> Self {
            Self {
                engine,
                document,
                todos,
                frame,
            }
        }

        /// Queue an operation. Returns `false` when an identical key is already pending.
        pub fn add_op<O: Operation + 'static>(&mut self, op: O) -> bool {
            let key = op.key();
            if !self.frame.seen.insert(key.clone()) {
                tracing::trace!(op = %key, "duplicate operation skipped");
                return false;
            }
            self.frame.ops.push(Box::new(op));
            true
        }

        pub fn add_fn_op<I, S, F>(&mut self, name: &str, args: I, f: F) -> bool
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
            F: Fn(&mut OpContext<'_>, &[String]) -> anyhow::Result<Vec<Hunk>> + 'static,
        {
            let args = args.into_iter().map(Into::into).collect();
            self.add_op(FnOp::new(name, args, f))
        }

        /// Queue a callback to run after this level's ops have been applied.
        pub fn add_cb(
            &mut self,
            f: impl FnOnce(&mut TxContext<'_>) -> anyhow::Result<()> + 'static,
        ) {
            self.frame.callbacks.push_back(Box::new(f));
        }

        /// Snapshot rebuilt after the most recent batch.
        pub fn get_todo_map(&self) -> &'a TodoMap {
            self.todos
        }

        pub fn get_todo_by_id(&self, id: TodoId) -> Option<&'a TodoItem> {
            self.todos.get(id)
        }

        pub fn engine(&self) -> &'a TodoEngine {
            self.engine
        }

        pub fn document_id(&self) -> DocumentId {
            self.document
        }

        pub fn config(&self) -> &'a Config {
            &self.engine.config
        }
    }

    /* ------------------------------- Engine ------------------------------- */

    pub struct TodoEngine {
        config: Config,
        classifier: TodoClassifier,
        extractor: MetadataExtractor,
        parser: Box<dyn StructuralParser>,
        documents: RefCell<HashMap<DocumentId, Document>>,
        transactions: TransactionRegistry,
        providers: RefCell<HashMap<String, ValueProvider>>,
    }

    impl Default for TodoEngine {
        fn default() -> Self {
            Self::from_parts(Config::default(), Box::new(MarkdownListParser))
        }
    }

    impl TodoEngine {
        pub fn new(config: Config) -> Result<Self, EngineError> {
            Self::with_parser(config, Box::new(MarkdownListParser))
        }

        pub fn with_parser(
            config: Config,
            parser: Box<dyn StructuralParser>,
        ) -> Result<Self, EngineError> {
            config.validate()?;
            Ok(Self::from_parts(config, parser))
        }

        fn from_parts(config: Config, parser: Box<dyn StructuralParser>) -> Self {
            Self {
                classifier: TodoClassifier::new(&config),
                extractor: MetadataExtractor::new(&config),
                config,
                parser,
                documents: RefCell::new(HashMap::new()),
                transactions: TransactionRegistry::default(),
                providers: RefCell::new(HashMap::new()),
            }
        }

        pub fn config(&self) -> &Config {
            &self.config
        }

        /// Validate and swap the config; glyph and alias tables are recompiled.
        pub fn set_config(&mut self, config: Config) -> Result<(), EngineError> {
            config.validate()?;
            self.classifier = TodoClassifier::new(&config);
            self.extractor = MetadataExtractor::new(&config);
            self.config = config;
            tracing::debug!(states = self.config.todo_states.len(), "config updated");
            Ok(())
        }

        /* ----------------------------- Documents ----------------------------- */

        pub fn open_document(&self, name: impl Into<String>, text: &str) -> DocumentId {
            self.insert_document(Document::from_text(name, text))
        }

        pub fn load_file(&self, path: &Path) -> Result<DocumentId, EngineError> {
            let document = Document::from_path(path).map_err(|source| EngineError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(self.insert_document(document))
        }

        fn insert_document(&self, document: Document) -> DocumentId {
            let id = document.id();
            tracing::debug!(
                document = %id,
                name = document.name(),
                lines = document.line_count(),
                "opened document"
            );
            self.documents.borrow_mut().insert(id, document);
            id
        }

        pub fn save_file(&self, doc: DocumentId, path: &Path) -> Result<(), EngineError> {
            let text = self.document_text(doc)?;
            fs::write(path, text).map_err(|source| EngineError::Io {
                path: path.to_path_buf(),
                source,
            })
        }

        pub fn close_document(&self, doc: DocumentId) -> Result<(), EngineError> {
            self.ensure_idle(doc)?;
            self.documents
                .borrow_mut()
                .remove(&doc)
                .map(|_| ())
                .ok_or(EngineError::UnknownDocument(doc))
        }

        pub fn document_text(&self, doc: DocumentId) -> Result<String, EngineError> {
            self.with_document(doc, Document::text)
        }

        pub fn lines(&self, doc: DocumentId) -> Result<Vec<String>, EngineError> {
            self.with_document(doc, |d| d.lines().to_vec())
        }

        pub fn document_version(&self, doc: DocumentId) -> Result<u64, EngineError> {
            self.with_document(doc, Document::version)
        }

        pub fn transaction_phase(&self, doc: DocumentId) -> TxPhase {
            self.transactions.phase(doc)
        }

        /// Host-side edit outside any transaction. Returns whether the text changed.
        pub fn replace_text(&self, doc: DocumentId, text: &str) -> Result<bool, EngineError> {
            self.ensure_idle(doc)?;
            let mut documents = self.documents.borrow_mut();
            let document = documents
                .get_mut(&doc)
                .ok_or(EngineError::UnknownDocument(doc))?;
            Ok(document.replace_text(text)?)
        }

        fn with_document<T>(
            &self,
            doc: DocumentId,
            f: impl FnOnce(&Document) -> T,
        ) -> Result<T, EngineError> {
            let documents = self.documents.borrow();
            documents
                .get(&doc)
                .map(f)
                .ok_or(EngineError::UnknownDocument(doc))
        }

        fn ensure_idle(&self, doc: DocumentId) -> Result<(), EngineError> {
            if self.transactions.phase(doc) == TxPhase::Idle {
                return Ok(());
            }
            let name = self.with_document(doc, |d| d.name().to_string())?;
            Err(EngineError::Reentrancy {
                document: doc,
                name,
            })
        }

        /* ----------------------------- Discovery ----------------------------- */

        pub fn discover(&self, doc: DocumentId) -> Result<TodoMap, EngineError> {
            let mut documents = self.documents.borrow_mut();
            let document = documents
                .get_mut(&doc)
                .ok_or(EngineError::UnknownDocument(doc))?;
            let (lines, marks) = document.parts_mut();
            let tree = self.parser.parse(lines);
            Ok(TodoMapBuilder::new(&self.classifier, &self.extractor).build(lines, &tree, marks))
        }

        pub fn get_todo_at(
            &self,
            doc: DocumentId,
            row: usize,
            col: usize,
        ) -> Result<Option<TodoItem>, EngineError> {
            let todos = self.discover(doc)?;
            Ok(todos.item_at(Position::new(row, col)).cloned())
        }

        pub fn get_todo_by_id(
            &self,
            doc: DocumentId,
            id: TodoId,
        ) -> Result<Option<TodoItem>, EngineError> {
            let todos = self.discover(doc)?;
            Ok(todos.get(id).cloned())
        }

        fn require_todo(&self, doc: DocumentId, id: TodoId) -> Result<TodoItem, EngineError> {
            self.get_todo_by_id(doc, id)?
                .ok_or(EngineError::UnknownTodo(id))
        }

        pub fn extract_metadata(
            &self,
            doc: DocumentId,
            range: Range,
        ) -> Result<MetadataSet, EngineError> {
            self.with_document(doc, |d| self.extractor.extract(d.lines(), range))
        }

        /* ----------------------------- Conversion ----------------------------- */

        /// `[ ]`/`[x]` → glyphs, applied as one batch.
        pub fn convert_to_canonical(&self, doc: DocumentId) -> Result<bool, EngineError> {
            self.convert(doc, true)
        }

        /// Glyphs → `[ ]`/`[x]`, applied as one batch.
        pub fn convert_to_portable(&self, doc: DocumentId) -> Result<bool, EngineError> {
            self.convert(doc, false)
        }

        fn convert(&self, doc: DocumentId, to_canonical: bool) -> Result<bool, EngineError> {
            let changed = Rc::new(Cell::new(false));
            let flag = changed.clone();
            let name = if to_canonical {
                "convert_to_canonical"
            } else {
                "convert_to_portable"
            };
            self.run_transaction(doc, move |tx| {
                tx.add_fn_op(name, Vec::<String>::new(), move |cx, _| {
                    let mut lines = cx.lines().to_vec();
                    let modified = if to_canonical {
                        markdown_to_unicode(&mut lines, cx.config())
                    } else {
                        unicode_to_markdown(&mut lines, cx.config())
                    };
                    flag.set(modified);
                    Ok(diff_lines(cx.lines(), &lines))
                });
                Ok(())
            })?;
            Ok(changed.get())
        }

        /* ---------------------------- Transactions ---------------------------- */

        pub fn run_transaction<B>(
            &self,
            doc: DocumentId,
            body: B,
        ) -> Result<TransactionReport, EngineError>
        where
            B: FnOnce(&mut TxContext<'_>) -> anyhow::Result<()>,
        {
            self.run_transaction_with_post(doc, body, |_, _| {})
        }

        /// `post` runs once the document is idle again, so it may start a new transaction.
        pub fn run_transaction_with_post<B, P>(
            &self,
            doc: DocumentId,
            body: B,
            post: P,
        ) -> Result<TransactionReport, EngineError>
        where
            B: FnOnce(&mut TxContext<'_>) -> anyhow::Result<()>,
            P: FnOnce(&TodoEngine, &TransactionReport),
        {
            let report = self.drive(doc, body)?;
            post(self, &report);
            Ok(report)
        }

        fn drive<B>(&self, doc: DocumentId, body: B) -> Result<TransactionReport, EngineError>
        where
            B: FnOnce(&mut TxContext<'_>) -> anyhow::Result<()>,
        {
            let name = self.with_document(doc, |d| d.name().to_string())?;
            let guard = self.transactions.begin(doc, &name)?;
            let mut todos = self.discover(doc)?;
            let mut report = TransactionReport::default();

            let mut root = Frame::default();
            body(&mut TxContext::new(self, doc, &todos, &mut root))
                .map_err(|e| EngineError::Body(format!("{e:#}")))?;

            let mut stack = vec![root];
            while let Some(frame) = stack.last_mut() {
                if !frame.ops.is_empty() {
                    guard.enter(TxPhase::Applying);
                    let batch = std::mem::take(&mut frame.ops);
                    frame.seen.clear();
                    let micro = self.apply_batch(doc, &batch, &todos, &mut report)?;
                    for callback in micro.into_iter().rev() {
                        frame.callbacks.push_front(callback);
                    }
                    todos = self.discover(doc)?;
                    continue;
                }

                let Some(callback) = frame.callbacks.pop_front() else {
                    stack.pop();
                    continue;
                };
                guard.enter(TxPhase::Draining);
                let depth = stack.len();
                let mut child = Frame::default();
                let result = callback(&mut TxContext::new(self, doc, &todos, &mut child));
                if let Err(error) = result {
                    let error = format!("{error:#}");
                    tracing::warn!(document = %name, depth, %error, "transaction callback failed");
                    report.callback_failures.push(CallbackFailure { depth, error });
                }
                if !child.is_empty() {
                    stack.push(child);
                }
            }

            tracing::debug!(
                document = %name,
                patch_calls = report.patch_calls,
                ops = report.ops_applied,
                "transaction finished"
            );
            Ok(report)
        }

        /// Run every op against one snapshot and hand the merged hunks to the applier once.
        fn apply_batch(
            &self,
            doc: DocumentId,
            batch: &[Box<dyn Operation>],
            todos: &TodoMap,
            report: &mut TransactionReport,
        ) -> Result<Vec<Callback>, EngineError> {
            let mut callbacks = Vec::new();
            let mut hunks: Vec<Hunk> = Vec::new();
            let mut failures = Vec::new();
            {
                let documents = self.documents.borrow();
                let document = documents
                    .get(&doc)
                    .ok_or(EngineError::UnknownDocument(doc))?;
                for op in batch {
                    let mut cx =
                        OpContext::new(doc, document.lines(), todos, &self.config, &mut callbacks);
                    match op.apply(&mut cx) {
                        Ok(produced) => hunks.extend(produced),
                        Err(error) => failures.push(OpFailure {
                            key: op.key(),
                            error: format!("{error:#}"),
                        }),
                    }
                }
            }
            report.ops_applied += batch.len();
            for failure in &failures {
                tracing::error!(op = %failure.key, error = %failure.error, "operation failed");
            }
            report.op_failures.extend(failures);

            let hunk_count = hunks.len();
            let mut documents = self.documents.borrow_mut();
            let document = documents
                .get_mut(&doc)
                .ok_or(EngineError::UnknownDocument(doc))?;
            document.apply_hunks(hunks)?;
            report.patch_calls += 1;
            tracing::debug!(
                ops = batch.len(),
                hunks = hunk_count,
                version = document.version(),
                "applied batch"
            );
            Ok(callbacks)
        }

        /* ----------------------------- Operations ----------------------------- */

        /// Toggle with `smart_toggle` propagation.
        pub fn toggle(
            &self,
            doc: DocumentId,
            id: TodoId,
        ) -> Result<TransactionReport, EngineError> {
            let todo = self.require_todo(doc, id)?;
            self.run_transaction(doc, move |tx| {
                let target = tx.config().toggle_target(&todo.state);
                ops::queue_state_change(tx, id, target);
                Ok(())
            })
        }

        pub fn toggle_at(
            &self,
            doc: DocumentId,
            row: usize,
            col: usize,
        ) -> Result<TransactionReport, EngineError> {
            let todo = self
                .get_todo_at(doc, row, col)?
                .ok_or(EngineError::NoTodoAt { row })?;
            self.toggle(doc, todo.id)
        }

        pub fn set_state(
            &self,
            doc: DocumentId,
            id: TodoId,
            state: &str,
        ) -> Result<TransactionReport, EngineError> {
            if self.config.state(state).is_none() {
                return Err(EngineError::UnknownState(state.to_string()));
            }
            self.require_todo(doc, id)?;
            let op = SetState::new(id, state);
            self.run_transaction(doc, move |tx| {
                tx.add_op(op);
                Ok(())
            })
        }

        pub fn add_metadata(
            &self,
            doc: DocumentId,
            id: TodoId,
            tag: &str,
            value: Option<&str>,
        ) -> Result<TransactionReport, EngineError> {
            self.require_todo(doc, id)?;
            let op = AddMetadata {
                id,
                tag: tag.to_string(),
                value: value.map(str::to_string),
            };
            self.run_single(doc, op)
        }

        pub fn remove_metadata(
            &self,
            doc: DocumentId,
            id: TodoId,
            tag: &str,
        ) -> Result<TransactionReport, EngineError> {
            self.require_todo(doc, id)?;
            let op = RemoveMetadata {
                id,
                tag: tag.to_string(),
            };
            self.run_single(doc, op)
        }

        pub fn create_todo(
            &self,
            doc: DocumentId,
            row: usize,
        ) -> Result<TransactionReport, EngineError> {
            self.run_single(doc, CreateTodo { row })
        }

        pub fn remove_todo(
            &self,
            doc: DocumentId,
            id: TodoId,
        ) -> Result<TransactionReport, EngineError> {
            self.require_todo(doc, id)?;
            self.run_single(doc, RemoveTodo { id })
        }

        fn run_single<O: Operation + 'static>(
            &self,
            doc: DocumentId,
            op: O,
        ) -> Result<TransactionReport, EngineError> {
            self.run_transaction(doc, move |tx| {
                tx.add_op(op);
                Ok(())
            })
        }

        /* --------------------------- Value providers --------------------------- */

        /// Register choices for a tag (or alias; stored under the canonical name).
        pub fn register_value_provider(&self, tag: &str, provider: ValueProvider) {
            let canonical = self.config.canonical_tag(tag).unwrap_or(tag).to_string();
            self.providers.borrow_mut().insert(canonical, provider);
        }

        /// Falls back to the tag's configured `choices` when no provider is registered.
        pub fn request_metadata_choices(
            &self,
            doc: DocumentId,
            id: Option<TodoId>,
            tag: &str,
            on_ready: impl FnOnce(Vec<String>) + 'static,
        ) -> Result<Completion, EngineError> {
            let canonical = self.config.canonical_tag(tag).unwrap_or(tag).to_string();
            let todo = match id {
                Some(id) => Some(self.require_todo(doc, id)?),
                None => {
                    self.with_document(doc, |_| ())?;
                    None
                }
            };
            let registered = self.providers.borrow().get(&canonical).cloned();
            let provider = registered.unwrap_or_else(|| {
                ValueProvider::Static(
                    self.config
                        .metadata
                        .get(&canonical)
                        .map(|t| t.choices.clone())
                        .unwrap_or_default(),
                )
            });
            let cx = ChoiceContext {
                document: doc,
                tag: canonical,
                todo,
            };
            Ok(request_choices(&provider, &cx, on_ready))
        }
    }

}

pub use config::Config;
pub use crate::core::{DocumentId, EngineError, TodoId, TodoItem};
pub use engine::{TodoEngine, TransactionReport, TxContext, TxPhase};
pub use todo_map::TodoMap;
