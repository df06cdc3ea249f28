//! Delta accumulator and task-state parser
//!
//! The gateway streams agent output as partial text fragments. The
//! accumulator buffers them for the duration of one logical message; on
//! demand, `parse` extracts an optional stats record and an ordered task
//! list from whatever the buffer currently holds. Parsing is pure and
//! repeatable (the intended usage is append, parse, append, parse) and
//! an unrecognizable buffer yields `None`, never an error.
//!
//! Recognized shapes:
//! - stats line: `Day 42 | Streak: 5 | Hearts: 3 | XP: 1,250 | Level: 7`
//! - task line:  `1. [x] Review PR` / `2. [ ] Write tests`
//!
//! Numeric fields tolerate `,` grouping separators. The done/pending
//! marker glyphs are a configurable allow-list, not a hardcoded pair.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::wire::{extract_delta_text, stream_state};

static STATS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"Day\s+(\d[\d,]*)\s*\|\s*Streak:\s*(\d[\d,]*)\s*\|\s*Hearts:\s*(\d[\d,]*)\s*\|\s*XP:\s*(\d[\d,]*)\s*\|\s*Level:\s*(\d[\d,]*)",
    )
    .expect("stats pattern is valid")
});

static TASK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(\d+)[.)]\s+\[([^\]]*)\]\s*(.*)$").expect("task pattern is valid"));

// ----------------------------------------------------------------------------
// Parsed Records
// ----------------------------------------------------------------------------

/// Progress counters reported by the agent
///
/// Non-negative by construction; only ever set from parsed server
/// messages, never adjusted client-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub streak: u32,
    pub hearts: u32,
    pub xp: u32,
    pub level: u32,
}

/// One task line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskItem {
    pub id: u32,
    pub text: String,
    pub completed: bool,
}

/// Result of one successful parse of the accumulator buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedUpdate {
    pub day: Option<u32>,
    pub stats: Option<TaskStats>,
    pub items: Vec<TaskItem>,
}

impl ParsedUpdate {
    fn has_data(&self) -> bool {
        self.day.is_some() || self.stats.is_some() || !self.items.is_empty()
    }
}

/// Current task state as published to observers
///
/// Replaced wholesale from each successful parse: the agent always
/// resends the full current list, so items are never merged field by
/// field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBoard {
    pub day: Option<u32>,
    pub stats: Option<TaskStats>,
    pub items: Vec<TaskItem>,
}

// ----------------------------------------------------------------------------
// Marker Alphabet
// ----------------------------------------------------------------------------

/// Allow-lists for task completion markers
///
/// The agent's marker set is not contractually fixed, so both alphabets
/// are configurable. A line whose bracketed glyph is in neither set is
/// not a task line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerAlphabet {
    pub done: Vec<char>,
    pub pending: Vec<char>,
}

impl Default for MarkerAlphabet {
    fn default() -> Self {
        Self {
            done: vec!['x', 'X', '✓', '✔'],
            pending: vec![' ', '-'],
        }
    }
}

impl MarkerAlphabet {
    /// Classify a bracketed marker glyph; `None` means not a task line
    fn classify(&self, glyph: &str) -> Option<bool> {
        let trimmed = glyph.trim();
        if trimmed.is_empty() {
            // Both "[ ]" and "[]" read as pending
            return Some(false);
        }
        let mut chars = trimmed.chars();
        let (Some(c), None) = (chars.next(), chars.next()) else {
            return None;
        };
        if self.done.contains(&c) {
            Some(true)
        } else if self.pending.contains(&c) {
            Some(false)
        } else {
            None
        }
    }
}

// ----------------------------------------------------------------------------
// Delta Accumulator
// ----------------------------------------------------------------------------

/// Buffers streamed fragments of one logical message
#[derive(Debug, Clone, Default)]
pub struct DeltaAccumulator {
    buffer: String,
    alphabet: MarkerAlphabet,
}

impl DeltaAccumulator {
    /// Create an accumulator with the default marker alphabet
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an accumulator recognizing a custom marker alphabet
    pub fn with_alphabet(alphabet: MarkerAlphabet) -> Self {
        Self {
            buffer: String::new(),
            alphabet,
        }
    }

    /// Append a fragment to the buffer
    pub fn append(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    /// Clear the buffer for the next logical message
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// The accumulated text so far
    pub fn contents(&self) -> &str {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Extract structured data from the current buffer
    ///
    /// Pure and repeatable: calling this after every append is the
    /// intended usage. Returns `None` while the buffer holds nothing
    /// recognizable yet.
    pub fn parse(&self) -> Option<ParsedUpdate> {
        let (day, stats) = match STATS_RE.captures(&self.buffer) {
            Some(caps) => {
                let day = parse_count(&caps[1]);
                let stats = (|| {
                    Some(TaskStats {
                        streak: parse_count(&caps[2])?,
                        hearts: parse_count(&caps[3])?,
                        xp: parse_count(&caps[4])?,
                        level: parse_count(&caps[5])?,
                    })
                })();
                (day, stats)
            }
            None => (None, None),
        };

        let mut items = Vec::new();
        for caps in TASK_RE.captures_iter(&self.buffer) {
            let Some(completed) = self.alphabet.classify(&caps[2]) else {
                continue;
            };
            let Some(id) = parse_count(&caps[1]) else {
                continue;
            };
            items.push(TaskItem {
                id,
                text: caps[3].trim().to_string(),
                completed,
            });
        }

        let update = ParsedUpdate { day, stats, items };
        update.has_data().then_some(update)
    }
}

/// Parse a non-negative count, stripping `,` grouping separators
fn parse_count(raw: &str) -> Option<u32> {
    raw.replace(',', "").parse().ok()
}

// ----------------------------------------------------------------------------
// Task Tracker
// ----------------------------------------------------------------------------

/// Stream states that close the current logical message
const FINAL_STATES: &[&str] = &["final", "done", "complete", "completed"];

/// Feeds delta-bearing events into the accumulator and keeps the current
/// board
///
/// Owned by the connection engine; one tracker per client.
#[derive(Debug, Default)]
pub struct TaskTracker {
    accumulator: DeltaAccumulator,
    board: TaskBoard,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alphabet(alphabet: MarkerAlphabet) -> Self {
        Self {
            accumulator: DeltaAccumulator::with_alphabet(alphabet),
            board: TaskBoard::default(),
        }
    }

    /// Current board state
    pub fn board(&self) -> &TaskBoard {
        &self.board
    }

    /// Process one inbound event payload
    ///
    /// Returns the new board when this event changed it. A completion
    /// marker closes the logical message and resets the accumulator; the
    /// board itself persists until the next successful parse replaces it.
    pub fn handle_event(&mut self, payload: Option<&Value>) -> Option<TaskBoard> {
        let mut changed = false;

        if let Some(text) = payload.and_then(|p| extract_delta_text(p)) {
            self.accumulator.append(text);
            if let Some(update) = self.accumulator.parse() {
                let next = TaskBoard {
                    day: update.day,
                    stats: update.stats,
                    items: update.items,
                };
                if next != self.board {
                    self.board = next;
                    changed = true;
                }
            }
        }

        let is_final = payload
            .and_then(|p| stream_state(p))
            .is_some_and(|state| FINAL_STATES.contains(&state));
        if is_final {
            self.accumulator.reset();
        }

        changed.then(|| self.board.clone())
    }

    /// Drop any partial message, e.g. on disconnect
    pub fn reset(&mut self) {
        self.accumulator.reset();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const FULL: &str = "Day 42 | Streak: 5 | Hearts: 3 | XP: 1,250 | Level: 7\n1. [x] Review PR\n2. [ ] Write tests";

    #[test]
    fn test_parse_stats_and_items() {
        let mut acc = DeltaAccumulator::new();
        acc.append(FULL);

        let update = acc.parse().unwrap();
        assert_eq!(update.day, Some(42));
        assert_eq!(
            update.stats,
            Some(TaskStats {
                streak: 5,
                hearts: 3,
                xp: 1250,
                level: 7,
            })
        );
        assert_eq!(
            update.items,
            vec![
                TaskItem {
                    id: 1,
                    text: "Review PR".to_string(),
                    completed: true,
                },
                TaskItem {
                    id: 2,
                    text: "Write tests".to_string(),
                    completed: false,
                },
            ]
        );
    }

    #[test]
    fn test_parse_empty_buffer_is_none() {
        let acc = DeltaAccumulator::new();
        assert_eq!(acc.parse(), None);
    }

    #[test]
    fn test_parse_unrecognizable_buffer_is_none() {
        let mut acc = DeltaAccumulator::new();
        acc.append("Thinking about your request...");
        assert_eq!(acc.parse(), None);
    }

    #[test]
    fn test_incremental_appends_match_one_shot() {
        let mut incremental = DeltaAccumulator::new();
        let mut last = None;
        for fragment in ["Day 4", "2 | Str", "eak: 5 | Hearts: 3 | XP: 1,2", "50 | Level: 7\n1. [x] Re", "view PR\n2. [ ] Write tests"] {
            incremental.append(fragment);
            last = incremental.parse();
        }

        let mut one_shot = DeltaAccumulator::new();
        one_shot.append(FULL);

        assert_eq!(last, one_shot.parse());
        assert!(last.is_some());
    }

    #[test]
    fn test_parse_is_repeatable() {
        let mut acc = DeltaAccumulator::new();
        acc.append(FULL);

        let first = acc.parse();
        let second = acc.parse();
        assert_eq!(first, second);

        // Parsing does not consume the buffer
        assert_eq!(acc.contents(), FULL);
    }

    #[test]
    fn test_grouping_separators_stripped() {
        let mut acc = DeltaAccumulator::new();
        acc.append("Day 100 | Streak: 1,024 | Hearts: 3 | XP: 1,250,000 | Level: 99");

        let update = acc.parse().unwrap();
        assert_eq!(update.day, Some(100));
        let stats = update.stats.unwrap();
        assert_eq!(stats.streak, 1024);
        assert_eq!(stats.xp, 1_250_000);
    }

    #[test]
    fn test_task_line_variants() {
        let mut acc = DeltaAccumulator::new();
        acc.append("1) [✓] Ship release\n2. [] Clean up\n 3. [X] Indented done");

        let update = acc.parse().unwrap();
        assert_eq!(update.items.len(), 3);
        assert!(update.items[0].completed);
        assert_eq!(update.items[0].text, "Ship release");
        assert!(!update.items[1].completed);
        assert!(update.items[2].completed);
    }

    #[test]
    fn test_unknown_marker_glyph_is_not_a_task() {
        let mut acc = DeltaAccumulator::new();
        acc.append("1. [q] Mystery\n2. [x] Real");

        let update = acc.parse().unwrap();
        assert_eq!(update.items.len(), 1);
        assert_eq!(update.items[0].id, 2);
    }

    #[test]
    fn test_custom_marker_alphabet() {
        let alphabet = MarkerAlphabet {
            done: vec!['*'],
            pending: vec!['.'],
        };
        let mut acc = DeltaAccumulator::with_alphabet(alphabet);
        acc.append("1. [*] Starred\n2. [.] Dotted\n3. [x] Unrecognized now");

        let update = acc.parse().unwrap();
        assert_eq!(update.items.len(), 2);
        assert!(update.items[0].completed);
        assert!(!update.items[1].completed);
    }

    #[test]
    fn test_reset_clears_buffer() {
        let mut acc = DeltaAccumulator::new();
        acc.append(FULL);
        assert!(acc.parse().is_some());

        acc.reset();
        assert!(acc.is_empty());
        assert_eq!(acc.parse(), None);
    }

    #[test]
    fn test_tracker_publishes_on_change_and_resets_on_final() {
        let mut tracker = TaskTracker::new();

        // Fragment with no structure yet: no publish
        assert!(tracker
            .handle_event(Some(&json!({"text": "Working on it"})))
            .is_none());

        // Structure arrives
        let board = tracker
            .handle_event(Some(&json!({"message": {"text": format!("\n{FULL}")}})))
            .unwrap();
        assert_eq!(board.day, Some(42));
        assert_eq!(board.items.len(), 2);

        // Same content again: board unchanged, nothing published
        assert!(tracker.handle_event(Some(&json!({"text": ""}))).is_none());

        // Final marker closes the message; the board survives
        assert!(tracker
            .handle_event(Some(&json!({"state": "final"})))
            .is_none());
        assert_eq!(tracker.board().items.len(), 2);

        // Next message replaces the item set wholesale
        let board = tracker
            .handle_event(Some(&json!({"text": "1. [x] Only one left"})))
            .unwrap();
        assert_eq!(board.items.len(), 1);
        assert_eq!(board.items[0].text, "Only one left");
    }

    #[test]
    fn test_tracker_ignores_payload_without_text() {
        let mut tracker = TaskTracker::new();
        assert!(tracker.handle_event(Some(&json!({"kind": "presence"}))).is_none());
        assert!(tracker.handle_event(None).is_none());
    }
}
