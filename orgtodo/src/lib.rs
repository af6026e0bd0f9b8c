//! Outline/TODO document library for plain-text Org files.
//! The pipeline is line-oriented: classify each line, build the heading tree with a stack,
//! pull planning/clock directives out of content lines, and format the tree back to text
//! without rewriting anything the parser did not interpret.

pub mod core {
    use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{fmt, path::PathBuf};
    use uuid::Uuid;

    /* ------------------------------ Markers ------------------------------ */

    pub const SCHEDULED_MARKER: &str = "SCHEDULED:";
    pub const DEADLINE_MARKER: &str = "DEADLINE:";
    pub const CLOCK_MARKER: &str = "CLOCK:";
    pub const DRAWER_START: &str = ":LOGBOOK:";
    pub const DRAWER_END: &str = ":END:";
    pub const CODE_BEGIN: &str = "#+BEGIN_SRC";
    pub const CODE_END: &str = "#+END_SRC";

    /* ------------------------------- IDs ------------------------------- */

    /// Arena handle for an [`Item`]. Never reused, so a handle to a deleted item stays dead.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ItemId(pub Uuid);

    impl ItemId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    /// Lifecycle state of a heading. Declaration order is the cycle order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub enum TodoState {
        #[default]
        None,
        Todo,
        Prog,
        Block,
        Done,
    }

    impl TodoState {
        pub const CYCLE: [TodoState; 5] = [
            TodoState::None,
            TodoState::Todo,
            TodoState::Prog,
            TodoState::Block,
            TodoState::Done,
        ];

        pub fn next(self) -> Self {
            Self::CYCLE[(self as usize + 1) % Self::CYCLE.len()]
        }

        pub fn prev(self) -> Self {
            let len = Self::CYCLE.len();
            Self::CYCLE[(self as usize + len - 1) % len]
        }

        pub fn keyword(self) -> Option<&'static str> {
            match self {
                TodoState::None => None,
                TodoState::Todo => Some("TODO"),
                TodoState::Prog => Some("PROG"),
                TodoState::Block => Some("BLOCK"),
                TodoState::Done => Some("DONE"),
            }
        }

        pub fn from_keyword(s: &str) -> Option<Self> {
            Self::CYCLE
                .into_iter()
                .find(|state| state.keyword() == Some(s))
        }
    }

    impl fmt::Display for TodoState {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.keyword().unwrap_or(""))
        }
    }

    /// Calendar timestamp used by SCHEDULED/DEADLINE. The weekday label is derived on output.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct Timestamp {
        pub date: NaiveDate,
        pub time: Option<NaiveTime>,
    }

    impl Timestamp {
        pub fn on(date: NaiveDate) -> Self {
            Self { date, time: None }
        }

        pub fn at(date: NaiveDate, time: NaiveTime) -> Self {
            Self {
                date,
                time: Some(time),
            }
        }
    }

    impl fmt::Display for Timestamp {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.date.format("%Y-%m-%d %a"))?;
            if let Some(time) = self.time {
                write!(f, " {}", time.format("%H:%M"))?;
            }
            Ok(())
        }
    }

    /// One interval of work. `end == None` means the clock is still running.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ClockEntry {
        pub start: NaiveDateTime,
        pub end: Option<NaiveDateTime>,
    }

    impl ClockEntry {
        pub fn open(start: NaiveDateTime) -> Self {
            Self { start, end: None }
        }

        pub fn is_open(&self) -> bool {
            self.end.is_none()
        }

        /// Closed entries report their span; an open entry reports time elapsed until `now`.
        pub fn duration_at(&self, now: NaiveDateTime) -> Duration {
            self.end.unwrap_or(now) - self.start
        }

        pub fn render(&self) -> String {
            let mut line = format!("{CLOCK_MARKER} [{}]", format_clock_time(self.start));
            if let Some(end) = self.end {
                line.push_str(&format!("--[{}]", format_clock_time(end)));
            }
            line
        }
    }

    pub fn format_clock_time(t: NaiveDateTime) -> String {
        t.format("%Y-%m-%d %a %H:%M").to_string()
    }

    /* ------------------------------ Entities ------------------------------ */

    /// Raw headline captured at parse time together with what it decoded to.
    /// While the decoded fields are unchanged the raw line is written back as-is.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct HeadlineSource {
        pub raw: String,
        pub level: usize,
        pub state: TodoState,
        pub title: String,
    }

    /// A heading node. Children are arena handles owned by the containing [`Document`].
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Item {
        /// Number of leading `*` markers.
        pub level: usize,
        pub state: TodoState,
        pub title: String,
        pub scheduled: Option<Timestamp>,
        pub deadline: Option<Timestamp>,

        /// Every content line seen under the heading, verbatim, directives included.
        /// Derived fields above are caches; this is what gets written back.
        #[serde(default)]
        pub notes: Vec<String>,

        #[serde(default)]
        pub(crate) children: Vec<ItemId>,

        #[serde(default)]
        pub folded: bool,

        #[serde(default)]
        pub clock_entries: Vec<ClockEntry>,

        #[serde(skip)]
        pub(crate) headline: Option<HeadlineSource>,
    }

    impl Item {
        pub fn new(level: usize, state: TodoState, title: impl Into<String>) -> Self {
            Self {
                level,
                state,
                title: title.into(),
                scheduled: None,
                deadline: None,
                notes: vec![],
                children: vec![],
                folded: false,
                clock_entries: vec![],
                headline: None,
            }
        }

        pub fn children(&self) -> &[ItemId] {
            &self.children
        }

        /// Notes as shown to a reader: logbook drawer and planning lines filtered out.
        pub fn display_notes(&self) -> Vec<&str> {
            let mut out = Vec::new();
            let mut in_logbook = false;
            for note in &self.notes {
                let trimmed = note.trim();
                if trimmed == DRAWER_START {
                    in_logbook = true;
                    continue;
                }
                if in_logbook {
                    if trimmed == DRAWER_END {
                        in_logbook = false;
                    }
                    continue;
                }
                if trimmed.starts_with(SCHEDULED_MARKER) || trimmed.starts_with(DEADLINE_MARKER) {
                    continue;
                }
                out.push(note.as_str());
            }
            out
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: one outline file, its items held in an arena keyed by [`ItemId`].
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Document {
        pub path: Option<PathBuf>,

        /// Lines before the first heading.
        #[serde(default)]
        pub preamble: Vec<String>,

        #[serde(default)]
        pub(crate) roots: Vec<ItemId>,

        #[serde(default)]
        pub(crate) items: IndexMap<ItemId, Item>,
    }

    impl Document {
        pub fn new(path: Option<PathBuf>) -> Self {
            Self {
                path,
                ..Self::default()
            }
        }

        pub fn roots(&self) -> &[ItemId] {
            &self.roots
        }

        pub fn item(&self, id: ItemId) -> Option<&Item> {
            self.items.get(&id)
        }

        pub fn item_mut(&mut self, id: ItemId) -> Option<&mut Item> {
            self.items.get_mut(&id)
        }

        pub fn children(&self, id: ItemId) -> &[ItemId] {
            self.items
                .get(&id)
                .map(|item| item.children.as_slice())
                .unwrap_or(&[])
        }

        pub fn contains(&self, id: ItemId) -> bool {
            self.items.contains_key(&id)
        }

        pub fn len(&self) -> usize {
            self.items.len()
        }

        pub fn is_empty(&self) -> bool {
            self.items.is_empty()
        }

        /// Adds `item` as the last child of `parent`, or as the last root when `parent`
        /// is `None` or unknown.
        pub(crate) fn attach(&mut self, parent: Option<ItemId>, item: Item) -> ItemId {
            let id = ItemId::new();
            self.items.insert(id, item);
            match parent.and_then(|p| self.items.get_mut(&p)) {
                Some(parent) => parent.children.push(id),
                None => self.roots.push(id),
            }
            id
        }
    }

    /* ---------------------------- Errors ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum OrgError {
        #[error("I/O error on {path:?}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("document has no path to save to")]
        MissingPath,
        #[error("unable to parse date `{0}` (use YYYY-MM-DD or +N)")]
        InvalidDate(String),
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn cycle_wraps_in_both_directions() {
            for state in TodoState::CYCLE {
                let mut s = state;
                for _ in 0..5 {
                    s = s.next();
                }
                assert_eq!(s, state);
                assert_eq!(state.next().prev(), state);
                assert_eq!(state.prev().next(), state);
            }
            assert_eq!(TodoState::Done.next(), TodoState::None);
            assert_eq!(TodoState::None.prev(), TodoState::Done);
        }

        #[test]
        fn keywords_round_trip() {
            for state in TodoState::CYCLE {
                if let Some(kw) = state.keyword() {
                    assert_eq!(TodoState::from_keyword(kw), Some(state));
                }
            }
            assert_eq!(TodoState::from_keyword("NEXT"), None);
        }

        #[test]
        fn timestamp_renders_weekday_and_optional_time() {
            let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
            assert_eq!(Timestamp::on(date).to_string(), "2024-01-15 Mon");
            let t = NaiveTime::from_hms_opt(9, 5, 0).unwrap();
            assert_eq!(Timestamp::at(date, t).to_string(), "2024-01-15 Mon 09:05");
        }

        #[test]
        fn display_notes_hide_logbook_and_planning() {
            let mut item = Item::new(1, TodoState::Todo, "Task");
            item.notes = vec![
                "SCHEDULED: <2024-01-15 Mon>".into(),
                ":LOGBOOK:".into(),
                "CLOCK: [2024-01-15 Mon 09:00]".into(),
                ":END:".into(),
                "Body text".into(),
            ];
            assert_eq!(item.display_notes(), vec!["Body text"]);
        }
    }
}

pub mod lexer {
    //! Per-line classification. Drawer and code-block regions are tracked with an explicit
    //! state machine; the two regions never overlap.

    use crate::core::{CODE_BEGIN, CODE_END, DRAWER_END, DRAWER_START};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum Passthrough {
        #[default]
        Normal,
        InDrawer,
        InCodeBlock,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LineKind {
        /// Drawer or code-block boundary. Kept verbatim.
        Boundary,
        /// Inside a code block. Kept verbatim, never interpreted.
        Verbatim,
        /// Inside a drawer. Directives apply, the heading grammar does not.
        DrawerContent,
        /// Heading candidate; plain content if it fails the heading grammar.
        Candidate,
    }

    #[derive(Debug, Default)]
    pub struct Classifier {
        mode: Passthrough,
    }

    impl Classifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn mode(&self) -> Passthrough {
            self.mode
        }

        pub fn classify(&mut self, line: &str) -> LineKind {
            match self.mode {
                Passthrough::Normal => {
                    if line.trim() == DRAWER_START {
                        self.mode = Passthrough::InDrawer;
                        LineKind::Boundary
                    } else if line.trim_start().starts_with(CODE_BEGIN) {
                        self.mode = Passthrough::InCodeBlock;
                        LineKind::Boundary
                    } else {
                        LineKind::Candidate
                    }
                }
                Passthrough::InDrawer => {
                    if line.trim() == DRAWER_END {
                        self.mode = Passthrough::Normal;
                        LineKind::Boundary
                    } else {
                        LineKind::DrawerContent
                    }
                }
                Passthrough::InCodeBlock => {
                    if line.trim_start().starts_with(CODE_END) {
                        self.mode = Passthrough::Normal;
                        LineKind::Boundary
                    } else {
                        LineKind::Verbatim
                    }
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn kinds(lines: &[&str]) -> Vec<LineKind> {
            let mut c = Classifier::new();
            lines.iter().map(|l| c.classify(l)).collect()
        }

        #[test]
        fn drawer_toggles_on_trimmed_markers() {
            let got = kinds(&["  :LOGBOOK:  ", "CLOCK: [x]", "* not a heading", " :END:", "* heading"]);
            assert_eq!(
                got,
                vec![
                    LineKind::Boundary,
                    LineKind::DrawerContent,
                    LineKind::DrawerContent,
                    LineKind::Boundary,
                    LineKind::Candidate,
                ]
            );
        }

        #[test]
        fn code_block_ignores_drawer_markers_inside() {
            let got = kinds(&["#+BEGIN_SRC rust", ":LOGBOOK:", "* fake", "  #+END_SRC", ":END:"]);
            assert_eq!(
                got,
                vec![
                    LineKind::Boundary,
                    LineKind::Verbatim,
                    LineKind::Verbatim,
                    LineKind::Boundary,
                    LineKind::Candidate,
                ]
            );
        }

        #[test]
        fn code_markers_are_case_sensitive() {
            let mut c = Classifier::new();
            assert_eq!(c.classify("#+begin_src sh"), LineKind::Candidate);
            assert_eq!(c.mode(), Passthrough::Normal);
        }

        #[test]
        fn unclosed_region_stays_open() {
            let mut c = Classifier::new();
            c.classify("#+BEGIN_SRC");
            for _ in 0..3 {
                assert_eq!(c.classify("* still code"), LineKind::Verbatim);
            }
            assert_eq!(c.mode(), Passthrough::InCodeBlock);
        }
    }
}

pub mod directive {
    //! SCHEDULED / DEADLINE / CLOCK recognition within content lines, built on `nom`.
    //!
    //! Markers may appear anywhere in a line. Bracket bodies are parsed against an ordered
    //! list of layouts; the first layout that consumes the whole body wins.

    use crate::core::*;
    use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while_m_n, take_while1},
        character::complete::{char, multispace0},
        combinator::{all_consuming, map, map_opt, map_res},
        error::VerboseError,
        sequence::{delimited, preceded, tuple},
    };
    use std::{ops::Range, str::FromStr};

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum PlanningKind {
        Scheduled,
        Deadline,
    }

    impl PlanningKind {
        pub fn marker(self) -> &'static str {
            match self {
                PlanningKind::Scheduled => SCHEDULED_MARKER,
                PlanningKind::Deadline => DEADLINE_MARKER,
            }
        }
    }

    /// Everything one content line contributes to its item's derived fields.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Directives {
        pub scheduled: Option<Timestamp>,
        pub deadline: Option<Timestamp>,
        pub clock: Option<ClockEntry>,
    }

    pub fn extract(line: &str) -> Directives {
        Directives {
            scheduled: planning_timestamp(line, PlanningKind::Scheduled),
            deadline: planning_timestamp(line, PlanningKind::Deadline),
            clock: clock_entry(line),
        }
    }

    pub fn planning_timestamp(line: &str, kind: PlanningKind) -> Option<Timestamp> {
        let found = directive_body(line, kind.marker(), '<', '>')?;
        let ts = parse_timestamp(found.body);
        if ts.is_none() {
            tracing::trace!(body = found.body, marker = kind.marker(), "unrecognized timestamp");
        }
        ts
    }

    pub fn clock_entry(line: &str) -> Option<ClockEntry> {
        clock_span(line).map(|(entry, _)| entry)
    }

    /// Parsed clock entry plus the byte offset just past its start bracket.
    pub(crate) fn clock_span(line: &str) -> Option<(ClockEntry, usize)> {
        let found = directive_body(line, CLOCK_MARKER, '[', ']')?;
        let start = parse_clock_time(found.body)?;
        let after_start = line.len() - found.rest.len();
        let closing: PResult<'_, &str> = preceded(tag("--"), bracketed('[', ']'))(found.rest);
        let end = match closing {
            Ok((_, body)) => Some(parse_clock_time(body)?),
            Err(_) => None,
        };
        Some((ClockEntry { start, end }, after_start))
    }

    /// Byte range of the `MARKER: <...>` directive in `line`. A marker that opens the line but
    /// has no well-formed bracket spans to the end of the line; a bare marker elsewhere is prose.
    pub(crate) fn planning_span(line: &str, kind: PlanningKind) -> Option<Range<usize>> {
        let marker = kind.marker();
        if let Some(found) = directive_body(line, marker, '<', '>') {
            return Some(found.start..line.len() - found.rest.len());
        }
        let trimmed = line.trim_start();
        trimmed
            .starts_with(marker)
            .then(|| line.len() - trimmed.len()..line.len())
    }

    /// `YYYY-MM-DD Www HH:MM`, `YYYY-MM-DD Www` or `YYYY-MM-DD`, tried in that order.
    pub fn parse_timestamp(body: &str) -> Option<Timestamp> {
        let with_time = map(
            tuple((date, char(' '), weekday, char(' '), time_hm)),
            |(d, _, _, _, t)| Timestamp::at(d, t),
        );
        let weekday_only = map(tuple((date, char(' '), weekday)), |(d, _, _)| Timestamp::on(d));
        let bare = map(date, Timestamp::on);
        let parsed: PResult<'_, Timestamp> = alt((
            all_consuming(with_time),
            all_consuming(weekday_only),
            all_consuming(bare),
        ))(body);
        parsed.ok().map(|(_, ts)| ts)
    }

    /// `YYYY-MM-DD Www HH:MM`, or the same with `:SS`.
    pub fn parse_clock_time(body: &str) -> Option<NaiveDateTime> {
        let minutes = map(
            tuple((date, char(' '), weekday, char(' '), time_hm)),
            |(d, _, _, _, t): (NaiveDate, char, Weekday, char, NaiveTime)| d.and_time(t),
        );
        let seconds = map(
            tuple((date, char(' '), weekday, char(' '), time_hms)),
            |(d, _, _, _, t): (NaiveDate, char, Weekday, char, NaiveTime)| d.and_time(t),
        );
        let parsed: PResult<'_, NaiveDateTime> =
            alt((all_consuming(minutes), all_consuming(seconds)))(body);
        parsed.ok().map(|(_, t)| t)
    }

    /// Interactive date entry: `+N` days from `today`, `YYYY-MM-DD`, `YYYY/MM/DD` or `MM/DD/YYYY`.
    pub fn parse_date_input(input: &str, today: NaiveDate) -> Result<Timestamp, OrgError> {
        let input = input.trim();
        let invalid = || OrgError::InvalidDate(input.to_string());
        if let Some(days) = input.strip_prefix('+') {
            let days: i64 = days.trim().parse().map_err(|_| invalid())?;
            return Duration::try_days(days)
                .and_then(|delta| today.checked_add_signed(delta))
                .map(Timestamp::on)
                .ok_or_else(invalid);
        }
        ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"]
            .into_iter()
            .find_map(|layout| NaiveDate::parse_from_str(input, layout).ok())
            .map(Timestamp::on)
            .ok_or_else(invalid)
    }

    /* ------------------------------- Grammar ------------------------------- */

    struct Found<'a> {
        start: usize,
        body: &'a str,
        rest: &'a str,
    }

    /// First occurrence of `marker` followed by optional whitespace and a bracketed body.
    fn directive_body<'a>(line: &'a str, marker: &str, open: char, close: char) -> Option<Found<'a>> {
        line.match_indices(marker).find_map(|(start, _)| {
            let after = &line[start + marker.len()..];
            let parsed: PResult<'_, &str> = preceded(multispace0, bracketed(open, close))(after);
            parsed.ok().map(|(rest, body)| Found { start, body, rest })
        })
    }

    fn bracketed<'a>(open: char, close: char) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
        delimited(char(open), take_while1(move |c: char| c != close), char(close))
    }

    fn number<'a, T: FromStr>(min: usize, max: usize) -> impl FnMut(&'a str) -> PResult<'a, T> {
        map_res(
            take_while_m_n(min, max, |c: char| c.is_ascii_digit()),
            |s: &str| s.parse::<T>(),
        )
    }

    fn date(i: &str) -> PResult<'_, NaiveDate> {
        map_opt(
            tuple((number(4, 4), char('-'), number(2, 2), char('-'), number(2, 2))),
            |(y, _, m, _, d): (i32, char, u32, char, u32)| NaiveDate::from_ymd_opt(y, m, d),
        )(i)
    }

    /// Weekday label; must name a weekday but is not checked against the date.
    fn weekday(i: &str) -> PResult<'_, Weekday> {
        map_res(take_while1(|c: char| c.is_ascii_alphabetic()), |s: &str| {
            s.parse::<Weekday>()
        })(i)
    }

    fn time_hm(i: &str) -> PResult<'_, NaiveTime> {
        map_opt(
            tuple((number(1, 2), char(':'), number(2, 2))),
            |(h, _, m): (u32, char, u32)| NaiveTime::from_hms_opt(h, m, 0),
        )(i)
    }

    fn time_hms(i: &str) -> PResult<'_, NaiveTime> {
        map_opt(
            tuple((
                number(1, 2),
                char(':'),
                number(2, 2),
                char(':'),
                number(2, 2),
            )),
            |(h, _, m, _, s): (u32, char, u32, char, u32)| NaiveTime::from_hms_opt(h, m, s),
        )(i)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        #[test]
        fn planning_layouts_in_order() {
            assert_eq!(
                parse_timestamp("2024-01-15 Mon 10:30"),
                Some(Timestamp::at(ymd(2024, 1, 15), NaiveTime::from_hms_opt(10, 30, 0).unwrap()))
            );
            assert_eq!(parse_timestamp("2024-01-15 Mon"), Some(Timestamp::on(ymd(2024, 1, 15))));
            assert_eq!(parse_timestamp("2024-01-15"), Some(Timestamp::on(ymd(2024, 1, 15))));
            assert_eq!(parse_timestamp("2024-01-15 10:30"), None);
            assert_eq!(parse_timestamp("2024-02-30 Fri"), None);
            assert_eq!(parse_timestamp("tomorrow"), None);
        }

        #[test]
        fn weekday_label_is_not_checked_against_date() {
            assert_eq!(parse_timestamp("2024-01-15 Fri"), Some(Timestamp::on(ymd(2024, 1, 15))));
        }

        #[test]
        fn scheduled_and_deadline_found_anywhere_in_line() {
            let d = extract("  SCHEDULED: <2024-01-15 Mon> DEADLINE:<2024-01-20 Sat 17:00>");
            assert_eq!(d.scheduled, Some(Timestamp::on(ymd(2024, 1, 15))));
            assert_eq!(
                d.deadline,
                Some(Timestamp::at(ymd(2024, 1, 20), NaiveTime::from_hms_opt(17, 0, 0).unwrap()))
            );
            assert_eq!(d.clock, None);
        }

        #[test]
        fn clock_open_and_closed() {
            let open = clock_entry("CLOCK: [2024-01-15 Mon 09:00]").unwrap();
            assert_eq!(open.start, ymd(2024, 1, 15).and_hms_opt(9, 0, 0).unwrap());
            assert!(open.is_open());

            let closed =
                clock_entry("  CLOCK: [2024-01-15 Mon 09:00]--[2024-01-15 Mon 10:15:30] =>  1:15")
                    .unwrap();
            assert_eq!(closed.end, Some(ymd(2024, 1, 15).and_hms_opt(10, 15, 30).unwrap()));
        }

        #[test]
        fn clock_with_bad_end_yields_nothing() {
            assert_eq!(clock_entry("CLOCK: [2024-01-15 Mon 09:00]--[later]"), None);
            assert_eq!(clock_entry("CLOCK: [whenever]"), None);
        }

        #[test]
        fn clock_span_points_past_start_bracket() {
            let line = "CLOCK: [2024-01-15 Mon 09:00] trailing";
            let (_, at) = clock_span(line).unwrap();
            assert_eq!(&line[at..], " trailing");
        }

        #[test]
        fn planning_span_covers_directive_only() {
            let line = "  DEADLINE: <2024-01-20 Sat> and more";
            let span = planning_span(line, PlanningKind::Deadline).unwrap();
            assert_eq!(&line[span], "DEADLINE: <2024-01-20 Sat>");

            let broken = "DEADLINE: soon";
            let span = planning_span(broken, PlanningKind::Deadline).unwrap();
            assert_eq!(span, 0..broken.len());
            assert_eq!(planning_span("plain", PlanningKind::Scheduled), None);
            assert_eq!(planning_span("the DEADLINE: slipped", PlanningKind::Deadline), None);
        }

        #[test]
        fn date_input_forms() {
            let today = ymd(2024, 1, 15);
            assert_eq!(parse_date_input("+3", today).unwrap(), Timestamp::on(ymd(2024, 1, 18)));
            assert_eq!(parse_date_input("2024-03-01", today).unwrap(), Timestamp::on(ymd(2024, 3, 1)));
            assert_eq!(parse_date_input("2024/03/01", today).unwrap(), Timestamp::on(ymd(2024, 3, 1)));
            assert_eq!(parse_date_input("03/01/2024", today).unwrap(), Timestamp::on(ymd(2024, 3, 1)));
            assert!(matches!(
                parse_date_input("next week", today),
                Err(OrgError::InvalidDate(_))
            ));
            assert!(parse_date_input("+x", today).is_err());
        }
    }
}

pub mod parser {
    //! Single forward pass over the text.
    //!
    //! - The lexer decides whether a line is a region boundary, verbatim, or interpretable.
    //! - Heading lines are parsed with `nom` and placed with a stack of open ancestors.
    //! - Every other line is appended verbatim to the open item's notes after directive
    //!   extraction; lines before the first heading form the preamble.

    use crate::core::*;
    use crate::directive;
    use crate::lexer::{Classifier, LineKind};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while1},
        combinator::value,
        error::VerboseError,
        sequence::{terminated, tuple},
    };
    use std::path::PathBuf;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeadingLine<'a> {
        pub level: usize,
        pub state: TodoState,
        pub title: &'a str,
    }

    /// Parse a whole document. Never fails: anything unrecognized becomes notes.
    pub fn parse_document(path: Option<PathBuf>, input: &str) -> Document {
        let mut doc = Document::new(path);
        let mut classifier = Classifier::new();
        // Open ancestors, innermost last: (handle, level).
        let mut stack: Vec<(ItemId, usize)> = Vec::new();

        for line in input.lines() {
            let current = stack.last().map(|(id, _)| *id);
            match classifier.classify(line) {
                LineKind::Boundary | LineKind::Verbatim => push_raw(&mut doc, current, line),
                LineKind::DrawerContent => push_content(&mut doc, current, line),
                LineKind::Candidate => match parse_heading(line) {
                    Some(heading) => open_heading(&mut doc, &mut stack, line, heading),
                    None => push_content(&mut doc, current, line),
                },
            }
        }

        tracing::debug!(
            items = doc.len(),
            preamble = doc.preamble.len(),
            unclosed = ?classifier.mode(),
            "parsed outline"
        );
        doc
    }

    /// `<stars><ws>[<STATE><ws>]<title>`, title non-empty.
    pub fn parse_heading(line: &str) -> Option<HeadingLine<'_>> {
        let parsed: PResult<'_, (&str, &str)> = tuple((stars, blanks))(line);
        let (rest, (stars, _)) = parsed.ok()?;
        let level = stars.len();

        let keyword: PResult<'_, TodoState> = terminated(state_keyword, blanks)(rest);
        if let Ok((title, state)) = keyword {
            if !title.is_empty() {
                return Some(HeadingLine { level, state, title });
            }
        }
        // `* TODO ` has no title after the keyword, so the keyword is the title.
        // Stars followed only by whitespace have no title at all and stay content.
        if rest.is_empty() {
            return None;
        }
        Some(HeadingLine {
            level,
            state: TodoState::None,
            title: rest,
        })
    }

    fn open_heading(
        doc: &mut Document,
        stack: &mut Vec<(ItemId, usize)>,
        line: &str,
        heading: HeadingLine<'_>,
    ) {
        while stack.last().is_some_and(|(_, level)| *level >= heading.level) {
            stack.pop();
        }

        let mut item = Item::new(heading.level, heading.state, heading.title);
        item.headline = Some(HeadlineSource {
            raw: line.to_string(),
            level: heading.level,
            state: heading.state,
            title: heading.title.to_string(),
        });

        let parent = stack.last().map(|(id, _)| *id);
        let id = doc.attach(parent, item);
        stack.push((id, heading.level));
    }

    fn push_raw(doc: &mut Document, current: Option<ItemId>, line: &str) {
        match current.and_then(|id| doc.item_mut(id)) {
            Some(item) => item.notes.push(line.to_string()),
            None => doc.preamble.push(line.to_string()),
        }
    }

    fn push_content(doc: &mut Document, current: Option<ItemId>, line: &str) {
        match current.and_then(|id| doc.item_mut(id)) {
            Some(item) => {
                let found = directive::extract(line);
                if found.scheduled.is_some() {
                    item.scheduled = found.scheduled;
                }
                if found.deadline.is_some() {
                    item.deadline = found.deadline;
                }
                if let Some(entry) = found.clock {
                    item.clock_entries.push(entry);
                }
                item.notes.push(line.to_string());
            }
            None => doc.preamble.push(line.to_string()),
        }
    }

    fn is_blank(c: char) -> bool {
        matches!(c, ' ' | '\t' | '\r' | '\u{c}')
    }

    fn stars(i: &str) -> PResult<'_, &str> {
        take_while1(|c: char| c == '*')(i)
    }

    fn blanks(i: &str) -> PResult<'_, &str> {
        take_while1(is_blank)(i)
    }

    fn state_keyword(i: &str) -> PResult<'_, TodoState> {
        alt((
            value(TodoState::Todo, tag("TODO")),
            value(TodoState::Prog, tag("PROG")),
            value(TodoState::Block, tag("BLOCK")),
            value(TodoState::Done, tag("DONE")),
        ))(i)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;

        fn titles(doc: &Document, ids: &[ItemId]) -> Vec<String> {
            ids.iter()
                .map(|id| doc.item(*id).unwrap().title.clone())
                .collect()
        }

        #[test]
        fn nesting_follows_levels() {
            let doc = parse_document(None, "* A\n** B\n* C\n");
            assert_eq!(titles(&doc, doc.roots()), vec!["A", "C"]);
            let a = doc.roots()[0];
            assert_eq!(titles(&doc, doc.children(a)), vec!["B"]);
            let b = doc.children(a)[0];
            assert_eq!(doc.item(b).unwrap().level, 2);
            assert_eq!(doc.item(a).unwrap().level, 1);
            assert_eq!(doc.item(doc.roots()[1]).unwrap().level, 1);
        }

        #[test]
        fn skipped_levels_attach_to_nearest_shallower_ancestor() {
            let doc = parse_document(None, "* A\n*** deep\n** mid\n");
            let a = doc.roots()[0];
            assert_eq!(titles(&doc, doc.children(a)), vec!["deep", "mid"]);
        }

        #[test]
        fn todo_heading_fields() {
            let doc = parse_document(None, "* TODO Buy milk\n");
            assert_eq!(doc.roots().len(), 1);
            let item = doc.item(doc.roots()[0]).unwrap();
            assert_eq!(item.level, 1);
            assert_eq!(item.state, TodoState::Todo);
            assert_eq!(item.title, "Buy milk");
            assert!(item.notes.is_empty());
            assert_eq!(item.scheduled, None);
        }

        #[test]
        fn heading_grammar_edges() {
            assert_eq!(parse_heading("*bold* text"), None);
            assert_eq!(parse_heading("*"), None);
            assert_eq!(parse_heading("*   "), None);

            let h = parse_heading("** TODO").unwrap();
            assert_eq!((h.level, h.state, h.title), (2, TodoState::None, "TODO"));

            let h = parse_heading("* TODOist").unwrap();
            assert_eq!((h.state, h.title), (TodoState::None, "TODOist"));

            let h = parse_heading("*\tBLOCK\t waiting on Q").unwrap();
            assert_eq!((h.state, h.title), (TodoState::Block, "waiting on Q"));
        }

        #[test]
        fn directives_populate_fields_and_stay_in_notes() {
            let doc = parse_document(None, "* TODO T\nSCHEDULED: <2024-01-15 Mon>\n");
            let item = doc.item(doc.roots()[0]).unwrap();
            assert_eq!(
                item.scheduled,
                Some(Timestamp::on(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()))
            );
            assert_eq!(item.notes, vec!["SCHEDULED: <2024-01-15 Mon>"]);
        }

        #[test]
        fn unparseable_directive_is_kept_as_text() {
            let doc = parse_document(None, "* T\nDEADLINE: <someday>\n");
            let item = doc.item(doc.roots()[0]).unwrap();
            assert_eq!(item.deadline, None);
            assert_eq!(item.notes, vec!["DEADLINE: <someday>"]);
        }

        #[test]
        fn logbook_clock_entries() {
            let text = "* Task\n:LOGBOOK:\nCLOCK: [2024-01-15 Mon 09:00]--[2024-01-15 Mon 10:00]\nCLOCK: [2024-01-16 Tue 09:00]\n:END:\nbody\n";
            let doc = parse_document(None, text);
            let item = doc.item(doc.roots()[0]).unwrap();
            assert_eq!(item.clock_entries.len(), 2);
            assert!(!item.clock_entries[0].is_open());
            assert!(item.clock_entries[1].is_open());
            assert_eq!(item.notes.len(), 5);
        }

        #[test]
        fn code_block_content_is_opaque() {
            let text = "* Notes\n#+BEGIN_SRC python\n* not a heading\nSCHEDULED: <2024-01-15 Mon>\n#+END_SRC\n* Next\n";
            let doc = parse_document(None, text);
            assert_eq!(titles(&doc, doc.roots()), vec!["Notes", "Next"]);
            let notes = doc.item(doc.roots()[0]).unwrap();
            assert_eq!(notes.notes.len(), 4);
            assert_eq!(notes.scheduled, None);
        }

        #[test]
        fn unclosed_code_block_absorbs_rest_of_file() {
            let doc = parse_document(None, "* A\n#+BEGIN_SRC\n* B\n** C\n");
            assert_eq!(doc.len(), 1);
            let a = doc.item(doc.roots()[0]).unwrap();
            assert_eq!(a.notes, vec!["#+BEGIN_SRC", "* B", "** C"]);
        }

        #[test]
        fn text_before_first_heading_is_preamble() {
            let doc = parse_document(None, "#+title: Inbox\n\n* A\n");
            assert_eq!(doc.preamble, vec!["#+title: Inbox", ""]);
            assert_eq!(doc.len(), 1);
        }
    }
}

pub mod outline {
    //! Document Model operations: state cycling, clocking, folding, capture, structural edits.
    //!
    //! Expected refusals (clocking twice, reordering across levels, deleting an unknown item)
    //! are reported through return values; the tree is left untouched.

    use crate::core::*;
    use crate::directive::{self, PlanningKind};
    use crate::lexer::{Classifier, LineKind};
    use chrono::{Duration, Local, NaiveDateTime};

    #[must_use]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ReorderStatus {
        Swapped,
        NotFound,
        LevelMismatch,
        NotAdjacent,
        /// No visible neighbour in the requested direction.
        AtEdge,
    }

    impl ReorderStatus {
        pub fn is_swapped(self) -> bool {
            self == ReorderStatus::Swapped
        }
    }

    pub fn now() -> NaiveDateTime {
        Local::now().naive_local()
    }

    /// Region verdict for every note line, replayed from the heading the way the parser saw it.
    fn note_kinds(notes: &[String]) -> Vec<LineKind> {
        let mut classifier = Classifier::new();
        notes.iter().map(|note| classifier.classify(note)).collect()
    }

    fn is_interpreted(kind: LineKind) -> bool {
        matches!(kind, LineKind::Candidate | LineKind::DrawerContent)
    }

    /// A line the parser reads as planning: it opens with SCHEDULED: or DEADLINE:.
    fn is_planning_line(note: &str, kind: LineKind) -> bool {
        let trimmed = note.trim_start();
        is_interpreted(kind)
            && (trimmed.starts_with(SCHEDULED_MARKER) || trimmed.starts_with(DEADLINE_MARKER))
    }

    /// Index just past the planning lines that open the notes.
    fn after_leading_planning(notes: &[String], kinds: &[LineKind]) -> usize {
        notes
            .iter()
            .zip(kinds)
            .take_while(|(note, kind)| is_planning_line(note, **kind))
            .count()
    }

    /* ------------------------------ Item ------------------------------ */

    impl Item {
        pub fn cycle_state_forward(&mut self) {
            self.state = self.state.next();
        }

        pub fn cycle_state_backward(&mut self) {
            self.state = self.state.prev();
        }

        pub fn toggle_fold(&mut self) {
            self.folded = !self.folded;
        }

        pub fn set_notes(&mut self, text: &str) {
            self.notes = if text.is_empty() {
                vec![]
            } else {
                text.split('\n').map(str::to_string).collect()
            };
        }

        pub fn is_clocked_in(&self) -> bool {
            self.clock_entries.iter().any(ClockEntry::is_open)
        }

        pub fn clock_in(&mut self) -> bool {
            self.clock_in_at(now())
        }

        /// Refuses while an entry is open. If the notes carry a logbook drawer, the new
        /// `CLOCK:` line is written into it so the drawer stays the source of truth. When the
        /// drawer marker only shows up as text (say, inside a code block) the formatter would
        /// not synthesize a drawer, so a real one is written into the notes.
        pub fn clock_in_at(&mut self, now: NaiveDateTime) -> bool {
            if self.is_clocked_in() {
                return false;
            }
            let entry = ClockEntry::open(now);
            self.clock_entries.push(entry);
            let kinds = note_kinds(&self.notes);
            if let Some(at) = self.logbook_insert_position(&kinds) {
                self.notes.insert(at, entry.render());
            } else if self.notes.iter().any(|n| n.contains(DRAWER_START)) {
                let at = after_leading_planning(&self.notes, &kinds);
                let drawer = std::iter::once(DRAWER_START.to_string())
                    .chain(self.clock_entries.iter().map(ClockEntry::render))
                    .chain(std::iter::once(DRAWER_END.to_string()));
                self.notes.splice(at..at, drawer);
            }
            true
        }

        pub fn clock_out(&mut self) -> bool {
            self.clock_out_at(now())
        }

        pub fn clock_out_at(&mut self, now: NaiveDateTime) -> bool {
            let Some(entry) = self.clock_entries.iter_mut().rev().find(|e| e.is_open()) else {
                return false;
            };
            entry.end = Some(now);
            let start = entry.start;
            self.close_clock_line(start, now);
            true
        }

        pub fn current_open_duration(&self) -> Duration {
            self.current_open_duration_at(now())
        }

        pub fn current_open_duration_at(&self, now: NaiveDateTime) -> Duration {
            self.clock_entries
                .iter()
                .find(|e| e.is_open())
                .map(|e| now - e.start)
                .unwrap_or_else(Duration::zero)
        }

        pub fn total_duration(&self) -> Duration {
            self.total_duration_at(now())
        }

        pub fn total_duration_at(&self, now: NaiveDateTime) -> Duration {
            self.clock_entries
                .iter()
                .fold(Duration::zero(), |acc, e| acc + e.duration_at(now))
        }

        pub fn set_scheduled(&mut self, value: Option<Timestamp>) {
            self.set_planning(PlanningKind::Scheduled, value);
        }

        pub fn set_deadline(&mut self, value: Option<Timestamp>) {
            self.set_planning(PlanningKind::Deadline, value);
        }

        /// Only planning lines outside code blocks are edited; prose that merely mentions a
        /// marker is left alone. Clearing strips the directive from every planning line carrying
        /// it (dropping lines left blank). Setting rewrites the first one in place; with none
        /// present the formatter synthesizes the line on save, unless some other note mentions
        /// the marker, in which case the line is written into the notes here.
        pub fn set_planning(&mut self, kind: PlanningKind, value: Option<Timestamp>) {
            let kinds = note_kinds(&self.notes);
            match value {
                None => {
                    let notes = std::mem::take(&mut self.notes);
                    for (mut note, line_kind) in notes.into_iter().zip(kinds) {
                        if is_planning_line(&note, line_kind) {
                            if let Some(span) = directive::planning_span(&note, kind) {
                                let at_end = span.end == note.len();
                                note.replace_range(span, "");
                                if at_end {
                                    note.truncate(note.trim_end().len());
                                }
                                if note.trim().is_empty() {
                                    continue;
                                }
                            }
                        }
                        self.notes.push(note);
                    }
                }
                Some(ts) => {
                    let line = format!("{} <{}>", kind.marker(), ts);
                    let rewrite = self
                        .notes
                        .iter()
                        .zip(&kinds)
                        .enumerate()
                        .find_map(|(idx, (note, line_kind))| {
                            if !is_planning_line(note, *line_kind) {
                                return None;
                            }
                            directive::planning_span(note, kind).map(|span| (idx, span))
                        });
                    match rewrite {
                        Some((idx, span)) => self.notes[idx].replace_range(span, &line),
                        None if self.notes.iter().any(|n| n.contains(kind.marker())) => {
                            let at = after_leading_planning(&self.notes, &kinds);
                            self.notes.insert(at, line);
                        }
                        None => {}
                    }
                }
            }
            match kind {
                PlanningKind::Scheduled => self.scheduled = value,
                PlanningKind::Deadline => self.deadline = value,
            }
        }

        /// Index just before the first logbook drawer's `:END:` (or the end of notes if the
        /// drawer is never closed). `None` without a drawer; marker text inside a code block
        /// does not count.
        fn logbook_insert_position(&self, kinds: &[LineKind]) -> Option<usize> {
            let is_boundary = |idx: usize, marker: &str| {
                kinds[idx] == LineKind::Boundary && self.notes[idx].trim() == marker
            };
            let start = (0..self.notes.len()).find(|idx| is_boundary(*idx, DRAWER_START))?;
            let end = (start + 1..self.notes.len()).find(|idx| is_boundary(*idx, DRAWER_END));
            Some(end.unwrap_or(self.notes.len()))
        }

        fn close_clock_line(&mut self, start: NaiveDateTime, end: NaiveDateTime) {
            let wanted = format_clock_time(start);
            let kinds = note_kinds(&self.notes);
            for (note, kind) in self.notes.iter_mut().zip(kinds).rev() {
                if !is_interpreted(kind) {
                    continue;
                }
                let Some((entry, at)) = directive::clock_span(note) else {
                    continue;
                };
                if entry.is_open() && format_clock_time(entry.start) == wanted {
                    note.insert_str(at, &format!("--[{}]", format_clock_time(end)));
                    return;
                }
            }
        }
    }

    /* ---------------------------- Document ---------------------------- */

    impl Document {
        /// Pre-order traversal that does not descend into folded items.
        pub fn flatten_visible(&self) -> Vec<ItemId> {
            self.flatten(true)
        }

        /// Pre-order traversal of every item, folds ignored.
        pub fn flatten_all(&self) -> Vec<ItemId> {
            self.flatten(false)
        }

        fn flatten(&self, respect_folds: bool) -> Vec<ItemId> {
            let mut out = Vec::with_capacity(self.items.len());
            let mut pending: Vec<ItemId> = self.roots.iter().rev().copied().collect();
            while let Some(id) = pending.pop() {
                let Some(item) = self.items.get(&id) else {
                    continue;
                };
                out.push(id);
                if !(respect_folds && item.folded) {
                    pending.extend(item.children.iter().rev().copied());
                }
            }
            out
        }

        /// New level-1 TODO inserted as the first root.
        pub fn capture(&mut self, title: impl Into<String>) -> ItemId {
            let id = ItemId::new();
            self.items.insert(id, Item::new(1, TodoState::Todo, title));
            self.roots.insert(0, id);
            id
        }

        /// New TODO appended under `parent`, which is unfolded. `None` if `parent` is unknown.
        pub fn add_sub_task(&mut self, parent: ItemId, title: impl Into<String>) -> Option<ItemId> {
            let level = self.item(parent)?.level + 1;
            let id = self.attach(Some(parent), Item::new(level, TodoState::Todo, title));
            if let Some(parent) = self.item_mut(parent) {
                parent.folded = false;
            }
            Some(id)
        }

        /// Removes `target` with its whole subtree. Returns `false` if it is not in the tree.
        pub fn delete(&mut self, target: ItemId) -> bool {
            let Some((parent, index)) = self.locate(target) else {
                return false;
            };
            if let Some(list) = self.list_mut(parent) {
                list.remove(index);
            }
            let mut doomed = vec![target];
            while let Some(id) = doomed.pop() {
                if let Some(item) = self.items.shift_remove(&id) {
                    doomed.extend(item.children);
                }
            }
            true
        }

        /// Swaps `a` and `b` if they sit next to each other (either order) in the same list
        /// and share a level.
        pub fn swap_adjacent(&mut self, a: ItemId, b: ItemId) -> ReorderStatus {
            let (Some(item_a), Some(item_b)) = (self.item(a), self.item(b)) else {
                return ReorderStatus::NotFound;
            };
            if item_a.level != item_b.level {
                return ReorderStatus::LevelMismatch;
            }
            let Some((parent, index)) = self.locate(a) else {
                return ReorderStatus::NotFound;
            };
            let Some(list) = self.list_mut(parent) else {
                return ReorderStatus::NotFound;
            };
            let neighbour = if index > 0 && list[index - 1] == b {
                Some(index - 1)
            } else if list.get(index + 1) == Some(&b) {
                Some(index + 1)
            } else {
                None
            };
            match neighbour {
                Some(other) => {
                    list.swap(index, other);
                    ReorderStatus::Swapped
                }
                None => ReorderStatus::NotAdjacent,
            }
        }

        /// Swap with the previous item in visible order.
        pub fn move_up(&mut self, id: ItemId) -> ReorderStatus {
            let visible = self.flatten_visible();
            match visible.iter().position(|v| *v == id) {
                None => ReorderStatus::NotFound,
                Some(0) => ReorderStatus::AtEdge,
                Some(pos) => self.swap_adjacent(id, visible[pos - 1]),
            }
        }

        /// Swap with the next item in visible order.
        pub fn move_down(&mut self, id: ItemId) -> ReorderStatus {
            let visible = self.flatten_visible();
            match visible.iter().position(|v| *v == id) {
                None => ReorderStatus::NotFound,
                Some(pos) if pos + 1 >= visible.len() => ReorderStatus::AtEdge,
                Some(pos) => self.swap_adjacent(id, visible[pos + 1]),
            }
        }

        pub fn toggle_fold(&mut self, id: ItemId) -> bool {
            self.item_mut(id).map(Item::toggle_fold).is_some()
        }

        /// Depth-first: the root list first, then each subtree in document order.
        fn locate(&self, target: ItemId) -> Option<(Option<ItemId>, usize)> {
            if let Some(index) = self.roots.iter().position(|id| *id == target) {
                return Some((None, index));
            }
            let mut pending: Vec<ItemId> = self.roots.iter().rev().copied().collect();
            while let Some(id) = pending.pop() {
                let children = self.children(id);
                if let Some(index) = children.iter().position(|c| *c == target) {
                    return Some((Some(id), index));
                }
                pending.extend(children.iter().rev().copied());
            }
            None
        }

        fn list_mut(&mut self, parent: Option<ItemId>) -> Option<&mut Vec<ItemId>> {
            match parent {
                None => Some(&mut self.roots),
                Some(id) => self.items.get_mut(&id).map(|item| &mut item.children),
            }
        }
    }

}

pub mod format {
    //! Regenerates text from the tree. Planning lines and the logbook drawer are synthesized
    //! only when the notes do not already carry them.

    use super::core::*;

    pub fn format_document(doc: &Document) -> String {
        let mut out = String::new();
        for line in &doc.preamble {
            push_line(&mut out, line);
        }
        for id in doc.roots() {
            format_item(&mut out, doc, *id);
        }
        out
    }

    fn format_item(out: &mut String, doc: &Document, id: ItemId) {
        let Some(item) = doc.item(id) else {
            return;
        };

        push_line(out, &render_headline(item));

        let notes_mention = |marker: &str| item.notes.iter().any(|n| n.contains(marker));

        if let Some(ts) = &item.scheduled {
            if !notes_mention(SCHEDULED_MARKER) {
                push_line(out, &format!("{SCHEDULED_MARKER} <{ts}>"));
            }
        }
        if let Some(ts) = &item.deadline {
            if !notes_mention(DEADLINE_MARKER) {
                push_line(out, &format!("{DEADLINE_MARKER} <{ts}>"));
            }
        }
        if !item.clock_entries.is_empty() && !notes_mention(DRAWER_START) {
            push_line(out, DRAWER_START);
            for entry in &item.clock_entries {
                push_line(out, &entry.render());
            }
            push_line(out, DRAWER_END);
        }

        for note in &item.notes {
            push_line(out, note);
        }

        for child in item.children() {
            format_item(out, doc, *child);
        }
    }

    /// The captured source line while level, state and title are untouched; canonical
    /// `<stars> [STATE ]title` otherwise.
    pub fn render_headline(item: &Item) -> String {
        if let Some(src) = &item.headline {
            if src.level == item.level && src.state == item.state && src.title == item.title {
                return src.raw.clone();
            }
        }
        let mut buf = "*".repeat(item.level);
        if let Some(keyword) = item.state.keyword() {
            buf.push(' ');
            buf.push_str(keyword);
        }
        buf.push(' ');
        buf.push_str(&item.title);
        buf
    }

    fn push_line(out: &mut String, line: &str) {
        out.push_str(line);
        out.push('\n');
    }

}

pub mod agenda {
    //! Read-model projection of planning dates for agenda views. Folding is ignored.

    use super::core::*;
    use chrono::{Duration, NaiveDate};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum AgendaWhenKind {
        Scheduled,
        Deadline,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AgendaEntry {
        pub item: ItemId,
        pub kind: AgendaWhenKind,
        pub when: Timestamp,
        pub state: TodoState,
        pub title: String,
    }

    /// One entry per planning field dated before `today + days`, in document order.
    pub fn project(doc: &Document, today: NaiveDate, days: i64) -> Vec<AgendaEntry> {
        let horizon = Duration::try_days(days)
            .and_then(|delta| today.checked_add_signed(delta))
            .unwrap_or(NaiveDate::MAX);
        let mut out = Vec::new();
        for id in doc.flatten_all() {
            let Some(item) = doc.item(id) else {
                continue;
            };
            let planned = [
                (AgendaWhenKind::Scheduled, item.scheduled),
                (AgendaWhenKind::Deadline, item.deadline),
            ];
            for (kind, when) in planned {
                if let Some(when) = when {
                    if when.date < horizon {
                        out.push(AgendaEntry {
                            item: id,
                            kind,
                            when,
                            state: item.state,
                            title: item.title.clone(),
                        });
                    }
                }
            }
        }
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse_document;

        #[test]
        fn agenda_window_includes_overdue_and_ignores_folds() {
            let text = "* TODO Soon\nDEADLINE: <2024-01-18 Thu>\n* Parent\n** TODO Both\nSCHEDULED: <2024-01-01 Mon>\nDEADLINE: <2024-01-21 Sun>\n* TODO Later\nSCHEDULED: <2024-01-22 Mon>\n";
            let mut doc = parse_document(None, text);
            let parent = doc.roots()[1];
            doc.item_mut(parent).unwrap().folded = true;

            let today = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
            let entries = project(&doc, today, 7);
            let got: Vec<_> = entries
                .iter()
                .map(|e| (e.title.as_str(), e.kind))
                .collect();
            assert_eq!(
                got,
                vec![
                    ("Soon", AgendaWhenKind::Deadline),
                    ("Both", AgendaWhenKind::Scheduled),
                    ("Both", AgendaWhenKind::Deadline),
                ]
            );
        }
    }
}

pub mod storage {
    //! Whole-file load and save. A missing file loads as an empty document; every other
    //! I/O failure is returned with the underlying `io::Error` as its source.

    use crate::core::{Document, OrgError};
    use crate::format::format_document;
    use crate::parser::parse_document;
    use std::{fs, io, path::Path};

    pub fn load(path: impl AsRef<Path>) -> Result<Document, OrgError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => {
                let doc = parse_document(Some(path.to_path_buf()), &text);
                tracing::debug!(path = %path.display(), items = doc.len(), "loaded outline");
                Ok(doc)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no file yet; starting empty outline");
                Ok(Document::new(Some(path.to_path_buf())))
            }
            Err(source) => Err(OrgError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Rewrites the document's own file.
    pub fn save(doc: &Document) -> Result<(), OrgError> {
        let path = doc.path.as_deref().ok_or(OrgError::MissingPath)?;
        save_as(doc, path)
    }

    pub fn save_as(doc: &Document, path: impl AsRef<Path>) -> Result<(), OrgError> {
        let path = path.as_ref();
        let text = format_document(doc);
        fs::write(path, text.as_bytes()).map_err(|source| OrgError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), bytes = text.len(), "saved outline");
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::error::Error;

        #[test]
        fn missing_file_loads_empty() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("todo.org");
            let doc = load(&path).expect("load");
            assert!(doc.is_empty());
            assert_eq!(doc.path.as_deref(), Some(path.as_path()));
        }

        #[test]
        fn save_then_load_round_trips() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("todo.org");
            let text = "* TODO Write report\nSCHEDULED: <2024-01-15 Mon>\n** Outline\n";
            fs::write(&path, text).expect("seed");

            let mut doc = load(&path).expect("load");
            doc.capture("Inbox item");
            save(&doc).expect("save");

            let written = fs::read_to_string(&path).expect("read back");
            assert_eq!(written, format!("* TODO Inbox item\n{text}"));
            assert_eq!(load(&path).expect("reload").len(), 3);
        }

        #[test]
        fn reading_a_directory_is_fatal() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let err = load(tmp.path()).expect_err("directory is not a file");
            assert!(matches!(err, OrgError::Io { .. }));
            assert!(err.source().is_some());
        }

        #[test]
        fn save_without_path_is_rejected() {
            let doc = Document::default();
            assert!(matches!(save(&doc), Err(OrgError::MissingPath)));
        }

        #[test]
        fn save_into_missing_directory_fails() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("nope").join("todo.org");
            let doc = Document::new(Some(path));
            assert!(matches!(save(&doc), Err(OrgError::Io { .. })));
        }
    }
}

pub use format::format_document;
pub use parser::parse_document;
pub use storage::{load, save};
