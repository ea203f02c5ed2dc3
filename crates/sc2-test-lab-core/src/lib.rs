//! Match model and the pivot aggregations behind the test lab dashboard.
//!
//! Everything in this crate is a pure function of the match rows handed in;
//! nothing is cached between calls.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

/// Test group of matches that are excluded from every report.
pub const UNTRACKED_TEST_GROUP: i64 = -1;

/// Map name recorded on a match before the runner resolves it.
pub const UNRESOLVED_MAP_NAME: &str = "TBD";

/// Rendered in place of a percentage when no decided games exist.
pub const PLACEHOLDER: &str = "-";

pub const DIFFICULTY_ORDER: [&str; 9] = [
    "Easy",
    "Medium",
    "MediumHard",
    "Hard",
    "Harder",
    "VeryHard",
    "CheatVision",
    "CheatMoney",
    "CheatInsane",
];

pub const RACES: [&str; 3] = ["Terran", "Protoss", "Zerg"];

pub const BUILDS: [&str; 5] = ["Rush", "Timing", "Power", "Macro", "Air"];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LabError {
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MatchResult {
    Pending,
    Victory,
    Defeat,
    Tie,
    Aborted,
    /// Any other outcome string written by the runner; kept verbatim.
    Other(String),
}

impl MatchResult {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "Pending",
            Self::Victory => "Victory",
            Self::Defeat => "Defeat",
            Self::Tie => "Tie",
            Self::Aborted => "Aborted",
            Self::Other(raw) => raw,
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "Pending" => Self::Pending,
            "Victory" => Self::Victory,
            "Defeat" => Self::Defeat,
            "Tie" => Self::Tie,
            "Aborted" => Self::Aborted,
            other => Self::Other(other.to_string()),
        }
    }

    /// Victory and Defeat are the only outcomes that count towards win rates.
    #[must_use]
    pub fn is_decided(&self) -> bool {
        matches!(self, Self::Victory | Self::Defeat)
    }
}

impl Display for MatchResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for MatchResult {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<MatchResult> for String {
    fn from(value: MatchResult) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Match {
    pub id: i64,
    pub test_group_id: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_timestamp: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_timestamp: Option<OffsetDateTime>,
    pub map_name: String,
    pub opponent_race: String,
    pub opponent_difficulty: String,
    pub opponent_build: String,
    pub result: MatchResult,
    pub duration_in_game_time: Option<f64>,
}

impl Match {
    #[must_use]
    pub fn opponent_key(&self) -> OpponentKey {
        OpponentKey {
            race: self.opponent_race.clone(),
            difficulty: self.opponent_difficulty.clone(),
            build: self.opponent_build.clone(),
        }
    }

    #[must_use]
    pub fn is_concluded(&self) -> bool {
        self.end_timestamp.is_some()
    }
}

/// One test scenario: the (race, difficulty, build) the bot plays against.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct OpponentKey {
    pub race: String,
    pub difficulty: String,
    pub build: String,
}

impl Display for OpponentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.race, self.difficulty, self.build)
    }
}

/// Row fields the launcher supplies when it registers a match.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct NewMatch {
    pub test_group_id: i64,
    pub opponent_race: String,
    pub opponent_difficulty: String,
    pub opponent_build: String,
}

/// Terminal state written back once a match has been played.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCompletion {
    pub result: MatchResult,
    pub map_name: Option<String>,
    pub end_timestamp: OffsetDateTime,
    pub duration_in_game_time: Option<f64>,
}

impl MatchCompletion {
    /// # Errors
    /// Returns [`LabError::Validation`] when the result is still `Pending`
    /// or the duration is negative or not finite.
    pub fn validate(&self) -> Result<(), LabError> {
        if self.result == MatchResult::Pending {
            return Err(LabError::Validation(
                "completion result cannot be Pending".to_string(),
            ));
        }

        if let Some(duration) = self.duration_in_game_time {
            if !duration.is_finite() || duration < 0.0 {
                return Err(LabError::Validation(
                    "duration_in_game_time MUST be a non-negative number".to_string(),
                ));
            }
        }

        if let Some(map_name) = &self.map_name {
            if map_name.trim().is_empty() {
                return Err(LabError::Validation("map_name cannot be empty".to_string()));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct MatchFilter {
    pub difficulty: Option<String>,
    pub exclude_test_group: Option<i64>,
}

impl MatchFilter {
    /// Filter used by every dashboard view: untracked matches are dropped and
    /// an empty difficulty means "all difficulties".
    #[must_use]
    pub fn dashboard(difficulty: Option<&str>) -> Self {
        Self {
            difficulty: difficulty
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string),
            exclude_test_group: Some(UNTRACKED_TEST_GROUP),
        }
    }
}

/// Store-side seam the job launcher writes pending rows through.
pub trait MatchRegistry {
    type Error;

    /// Inserts a `Pending` match and returns its identifier.
    ///
    /// # Errors
    /// Implementation defined; the launcher aborts the batch on error.
    fn register_pending(&mut self, new_match: &NewMatch) -> Result<i64, Self::Error>;
}

/// Result shown for a match. Pending rows outside the latest batch can never
/// finish, so they are shown as aborted. The match itself is left untouched.
#[must_use]
pub fn display_status(record: &Match, is_latest_group: bool) -> MatchResult {
    if !is_latest_group && record.result == MatchResult::Pending {
        return MatchResult::Aborted;
    }
    record.result.clone()
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Tally {
    pub victories: u32,
    pub decided: u32,
}

impl Tally {
    pub fn record(&mut self, result: &MatchResult) {
        if result.is_decided() {
            self.decided += 1;
            if *result == MatchResult::Victory {
                self.victories += 1;
            }
        }
    }

    pub fn merge(&mut self, other: Tally) {
        self.victories += other.victories;
        self.decided += other.decided;
    }

    #[must_use]
    pub fn percentage(self) -> Option<f64> {
        if self.decided == 0 {
            return None;
        }
        Some(f64::from(self.victories) / f64::from(self.decided) * 100.0)
    }

    #[must_use]
    pub fn format_percentage(self, decimals: usize) -> Option<String> {
        self.percentage().map(|value| format!("{value:.decimals$}%"))
    }

    /// Whole-percent label used by the column rollups.
    #[must_use]
    pub fn rollup_label(self) -> String {
        self.format_percentage(0).unwrap_or_else(|| PLACEHOLDER.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct DurationTally {
    total: f64,
    count: u32,
}

impl DurationTally {
    fn record(&mut self, duration: Option<f64>) {
        if let Some(value) = duration.filter(|value| *value > 0.0) {
            self.total += value;
            self.count += 1;
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn average(self) -> Option<i64> {
        if self.count == 0 {
            return None;
        }
        Some((self.total / f64::from(self.count)).trunc() as i64)
    }
}

/// Position of a difficulty in the canonical order; unknown values rank last.
#[must_use]
pub fn difficulty_rank(difficulty: &str) -> usize {
    DIFFICULTY_ORDER
        .iter()
        .position(|known| *known == difficulty)
        .unwrap_or(DIFFICULTY_ORDER.len())
}

/// Distinct builds seen per (difficulty, race).
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct OpponentCatalogue {
    builds: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl OpponentCatalogue {
    #[must_use]
    pub fn from_matches(matches: &[Match]) -> Self {
        let mut catalogue = Self::default();
        for record in matches {
            catalogue
                .builds
                .entry(record.opponent_difficulty.clone())
                .or_default()
                .entry(record.opponent_race.clone())
                .or_default()
                .insert(record.opponent_build.clone());
        }
        catalogue
    }

    #[must_use]
    pub fn builds(&self, difficulty: &str, race: &str) -> Vec<String> {
        self.builds
            .get(difficulty)
            .and_then(|races| races.get(race))
            .map(|builds| builds.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Orders the catalogue into the column layout shared by every view.
    #[must_use]
    pub fn column_layout(&self) -> ColumnLayout {
        let mut difficulties: Vec<&String> = self.builds.keys().collect();
        difficulties.sort_by_key(|difficulty| difficulty_rank(difficulty));

        let difficulties = difficulties
            .into_iter()
            .map(|difficulty| DifficultyColumns {
                difficulty: difficulty.clone(),
                races: self.builds[difficulty]
                    .iter()
                    .map(|(race, builds)| RaceColumns {
                        race: race.clone(),
                        builds: builds.iter().cloned().collect(),
                    })
                    .collect(),
            })
            .collect();

        ColumnLayout { difficulties }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
pub struct ColumnLayout {
    pub difficulties: Vec<DifficultyColumns>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct DifficultyColumns {
    pub difficulty: String,
    pub races: Vec<RaceColumns>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct RaceColumns {
    pub race: String,
    pub builds: Vec<String>,
}

impl DifficultyColumns {
    #[must_use]
    pub fn span(&self) -> usize {
        self.races.iter().map(|race| race.builds.len()).sum()
    }
}

impl ColumnLayout {
    #[must_use]
    pub fn from_matches(matches: &[Match]) -> Self {
        OpponentCatalogue::from_matches(matches).column_layout()
    }

    /// Flattened opponent keys in canonical column order.
    #[must_use]
    pub fn opponents(&self) -> Vec<OpponentKey> {
        let mut opponents = Vec::new();
        for difficulty in &self.difficulties {
            for race in &difficulty.races {
                for build in &race.builds {
                    opponents.push(OpponentKey {
                        race: race.race.clone(),
                        difficulty: difficulty.difficulty.clone(),
                        build: build.clone(),
                    });
                }
            }
        }
        opponents
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.difficulties.iter().map(DifficultyColumns::span).sum()
    }
}

/// Victory/decided counts per opponent across every match handed in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpponentTallies {
    by_opponent: BTreeMap<OpponentKey, Tally>,
}

impl OpponentTallies {
    #[must_use]
    pub fn from_matches(matches: &[Match]) -> Self {
        let mut by_opponent: BTreeMap<OpponentKey, Tally> = BTreeMap::new();
        for record in matches {
            by_opponent
                .entry(record.opponent_key())
                .or_default()
                .record(&record.result);
        }
        Self { by_opponent }
    }

    #[must_use]
    pub fn opponent(&self, key: &OpponentKey) -> Tally {
        self.by_opponent.get(key).copied().unwrap_or_default()
    }

    /// Sums the tallies of the layout columns accepted by `include`.
    pub fn sum_columns(
        &self,
        layout: &ColumnLayout,
        include: impl Fn(&OpponentKey) -> bool,
    ) -> Tally {
        let mut total = Tally::default();
        for key in layout.opponents().iter().filter(|key| include(key)) {
            total.merge(self.opponent(key));
        }
        total
    }

    #[must_use]
    pub fn opponent_win_rates(&self, layout: &ColumnLayout) -> Vec<String> {
        layout
            .opponents()
            .iter()
            .map(|key| self.opponent(key).rollup_label())
            .collect()
    }

    #[must_use]
    pub fn race_win_rate(&self, layout: &ColumnLayout, difficulty: &str, race: &str) -> String {
        self.sum_columns(layout, |key| key.difficulty == difficulty && key.race == race)
            .rollup_label()
    }

    #[must_use]
    pub fn difficulty_win_rate(&self, layout: &ColumnLayout, difficulty: &str) -> String {
        self.sum_columns(layout, |key| key.difficulty == difficulty)
            .rollup_label()
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct DifficultyHeader {
    pub difficulty: String,
    pub span: usize,
    pub win_rate: String,
    pub races: Vec<RaceHeader>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct RaceHeader {
    pub race: String,
    pub span: usize,
    pub win_rate: String,
    pub builds: Vec<BuildHeader>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct BuildHeader {
    pub build: String,
    pub win_rate: Option<String>,
}

/// Nested difficulty / race / build header. Each span equals the number of
/// leaf columns below it.
#[must_use]
pub fn build_header_tree(
    layout: &ColumnLayout,
    tallies: Option<&OpponentTallies>,
) -> Vec<DifficultyHeader> {
    layout
        .difficulties
        .iter()
        .map(|difficulty| {
            let races = difficulty
                .races
                .iter()
                .map(|race| RaceHeader {
                    race: race.race.clone(),
                    span: race.builds.len(),
                    win_rate: tallies.map_or_else(
                        || PLACEHOLDER.to_string(),
                        |tallies| {
                            tallies.race_win_rate(layout, &difficulty.difficulty, &race.race)
                        },
                    ),
                    builds: race
                        .builds
                        .iter()
                        .map(|build| BuildHeader {
                            build: build.clone(),
                            win_rate: tallies.map(|tallies| {
                                tallies
                                    .opponent(&OpponentKey {
                                        race: race.race.clone(),
                                        difficulty: difficulty.difficulty.clone(),
                                        build: build.clone(),
                                    })
                                    .rollup_label()
                            }),
                        })
                        .collect(),
                })
                .collect();

            DifficultyHeader {
                difficulty: difficulty.difficulty.clone(),
                span: difficulty.span(),
                win_rate: tallies.map_or_else(
                    || PLACEHOLDER.to_string(),
                    |tallies| tallies.difficulty_win_rate(layout, &difficulty.difficulty),
                ),
                races,
            }
        })
        .collect()
}

/// A match as shown in one pivot cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PivotCell {
    pub match_id: i64,
    pub result: MatchResult,
    pub map_name: String,
    pub duration_in_game_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchRow {
    pub test_group_id: i64,
    pub cells: Vec<Option<PivotCell>>,
    pub win_percentage: String,
    pub avg_duration: Option<i64>,
}

/// One row per test group, newest first, with one cell per layout column.
///
/// A cell holds the last match seen for its (group, opponent) pair. Group
/// statistics are counted over every match of the group using the displayed
/// result; matches relabeled by [`display_status`] count towards neither
/// win rate nor duration.
#[must_use]
pub fn pivot_by_batch(matches: &[Match], layout: &ColumnLayout) -> Vec<BatchRow> {
    let mut groups: BTreeMap<i64, Vec<&Match>> = BTreeMap::new();
    for record in matches {
        groups.entry(record.test_group_id).or_default().push(record);
    }

    let Some(latest_group) = groups.keys().next_back().copied() else {
        return Vec::new();
    };
    let opponents = layout.opponents();

    groups
        .iter()
        .rev()
        .map(|(test_group_id, records)| {
            let is_latest = *test_group_id == latest_group;

            let mut cells_by_opponent: BTreeMap<OpponentKey, &Match> = BTreeMap::new();
            let mut tally = Tally::default();
            let mut durations = DurationTally::default();
            for record in records {
                cells_by_opponent.insert(record.opponent_key(), record);

                let shown = display_status(record, is_latest);
                if shown != record.result {
                    continue;
                }
                tally.record(&shown);
                durations.record(record.duration_in_game_time);
            }

            let cells = opponents
                .iter()
                .map(|key| {
                    cells_by_opponent.get(key).map(|record| PivotCell {
                        match_id: record.id,
                        result: display_status(record, is_latest),
                        map_name: record.map_name.clone(),
                        duration_in_game_time: record.duration_in_game_time,
                    })
                })
                .collect();

            BatchRow {
                test_group_id: *test_group_id,
                cells,
                win_percentage: tally
                    .format_percentage(1)
                    .unwrap_or_else(|| PLACEHOLDER.to_string()),
                avg_duration: durations.average(),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct MapCell {
    pub win_percentage: Option<String>,
    pub avg_duration: Option<i64>,
    pub victories: u32,
    pub games: u32,
}

impl MapCell {
    fn from_matches<'a>(records: impl IntoIterator<Item = &'a Match>) -> Self {
        let mut tally = Tally::default();
        let mut durations = DurationTally::default();
        for record in records {
            tally.record(&record.result);
            durations.record(record.duration_in_game_time);
        }
        Self {
            win_percentage: tally.format_percentage(0),
            avg_duration: durations.average(),
            victories: tally.victories,
            games: tally.decided,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct MapRow {
    pub map_name: String,
    pub cells: Vec<Option<MapCell>>,
    pub summary: MapCell,
}

/// One row per map in ascending name order. Unlike [`pivot_by_batch`], every
/// match of a (map, opponent) pair contributes to its cell.
#[must_use]
pub fn pivot_by_map(matches: &[Match], layout: &ColumnLayout) -> Vec<MapRow> {
    let mut maps: BTreeMap<&str, BTreeMap<OpponentKey, Vec<&Match>>> = BTreeMap::new();
    for record in matches {
        maps.entry(record.map_name.as_str())
            .or_default()
            .entry(record.opponent_key())
            .or_default()
            .push(record);
    }

    let opponents = layout.opponents();
    maps.into_iter()
        .map(|(map_name, by_opponent)| {
            let cells = opponents
                .iter()
                .map(|key| {
                    by_opponent
                        .get(key)
                        .map(|records| MapCell::from_matches(records.iter().copied()))
                })
                .collect();
            let summary = MapCell::from_matches(by_opponent.values().flatten().copied());

            MapRow {
                map_name: map_name.to_string(),
                cells,
                summary,
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchListView {
    pub opponents: Vec<String>,
    pub header: Vec<DifficultyHeader>,
    pub win_rates: Vec<String>,
    pub rows: Vec<BatchRow>,
}

#[must_use]
pub fn match_list_view(matches: &[Match]) -> MatchListView {
    let layout = ColumnLayout::from_matches(matches);
    let tallies = OpponentTallies::from_matches(matches);

    MatchListView {
        opponents: layout.opponents().iter().map(ToString::to_string).collect(),
        header: build_header_tree(&layout, Some(&tallies)),
        win_rates: tallies.opponent_win_rates(&layout),
        rows: pivot_by_batch(matches, &layout),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapBreakdownView {
    pub opponents: Vec<String>,
    pub header: Vec<DifficultyHeader>,
    pub rows: Vec<MapRow>,
}

#[must_use]
pub fn map_breakdown_view(matches: &[Match]) -> MapBreakdownView {
    let layout = ColumnLayout::from_matches(matches);
    let tallies = OpponentTallies::from_matches(matches);

    MapBreakdownView {
        opponents: layout.opponents().iter().map(ToString::to_string).collect(),
        header: build_header_tree(&layout, Some(&tallies)),
        rows: pivot_by_map(matches, &layout),
    }
}

/// Parses an RFC3339 timestamp and normalizes it to UTC.
///
/// # Errors
/// Returns [`LabError::Validation`] when parsing fails.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LabError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
        .map_err(|err| LabError::Validation(format!("invalid RFC3339 timestamp: {err}")))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LabError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LabError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            LabError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
