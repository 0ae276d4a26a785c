//! Context notes: keyword matching, random sampling and the always-send digest.

use quill_core::{Note, NoteKind};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ContextResult;

const BLOCK_SEPARATOR: &str = "\n\n";

/// Sampling switches for the note matcher.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteSettings {
    /// Chance per turn that moment notes are sampled, in `[0, 1]`
    pub random_frequency: f64,
    /// Moment notes drawn when sampling runs
    pub random_count: usize,
    pub keyword_match_enabled: bool,
    pub always_send_enabled: bool,
}

impl Default for NoteSettings {
    fn default() -> Self {
        Self {
            random_frequency: 0.3,
            random_count: 1,
            keyword_match_enabled: true,
            always_send_enabled: true,
        }
    }
}

/// Whether the random branch runs this turn.
pub fn should_sample<R: Rng + ?Sized>(frequency: f64, rng: &mut R) -> bool {
    rng.gen::<f64>() < frequency
}

fn render_block(note: &Note) -> String {
    format!("【{}】\n{}", note.title, note.content)
}

fn join_blocks<'a>(blocks: impl IntoIterator<Item = &'a Note>) -> String {
    blocks
        .into_iter()
        .map(render_block)
        .collect::<Vec<_>>()
        .join(BLOCK_SEPARATOR)
}

/// Ordered collection of notes plus matcher settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoteBook {
    notes: Vec<Note>,
    settings: NoteSettings,
}

impl NoteBook {
    pub fn new(notes: Vec<Note>, settings: NoteSettings) -> Self {
        Self { notes, settings }
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Note> {
        self.notes.get(index)
    }

    pub fn settings(&self) -> NoteSettings {
        self.settings
    }

    pub fn update_settings(&mut self, settings: NoteSettings) {
        self.settings = settings;
    }

    /// Full blocks of every note whose keywords occur in `text`.
    pub fn keyword_match(&self, text: &str) -> String {
        if !self.settings.keyword_match_enabled {
            return String::new();
        }
        join_blocks(self.notes.iter().filter(|note| note.matches(text)))
    }

    /// Up to `count` moment notes, drawn without replacement.
    pub fn random_match<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> String {
        let mut moments: Vec<&Note> = self
            .notes
            .iter()
            .filter(|note| note.kind == NoteKind::Moment)
            .collect();
        if moments.is_empty() {
            return String::new();
        }

        moments.shuffle(rng);
        moments.truncate(count);
        join_blocks(moments)
    }

    /// Keyword block, then with probability `frequency` a random block.
    pub fn matched_text<R: Rng + ?Sized>(
        &self,
        text: &str,
        frequency: f64,
        count: usize,
        rng: &mut R,
    ) -> String {
        let keyword = self.keyword_match(text);
        let random = if should_sample(frequency, rng) {
            self.random_match(count, rng)
        } else {
            String::new()
        };

        debug!(
            keyword_chars = keyword.len(),
            random_chars = random.len(),
            "Notes: matched text"
        );

        [keyword, random]
            .into_iter()
            .filter(|block| !block.is_empty())
            .collect::<Vec<_>>()
            .join(BLOCK_SEPARATOR)
    }

    /// `matched_text` using the configured frequency and count.
    pub fn matched_text_with_settings<R: Rng + ?Sized>(&self, text: &str, rng: &mut R) -> String {
        let NoteSettings {
            random_frequency,
            random_count,
            ..
        } = self.settings;
        self.matched_text(text, random_frequency, random_count, rng)
    }

    /// One `title：summary` line per note with a non-empty summary.
    pub fn always_send_summary(&self) -> String {
        if !self.settings.always_send_enabled {
            return String::new();
        }
        self.notes
            .iter()
            .filter(|note| !note.summary().is_empty())
            .map(|note| format!("{}：{}", note.title, note.summary()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Append a validated note, returning its index.
    pub fn add(&mut self, note: Note) -> ContextResult<usize> {
        note.validate()?;
        self.notes.push(note);
        Ok(self.notes.len() - 1)
    }

    /// Insert at `index` (`index == len` appends). `Ok(false)` when out of range.
    pub fn insert_at(&mut self, index: usize, note: Note) -> ContextResult<bool> {
        note.validate()?;
        if index > self.notes.len() {
            return Ok(false);
        }
        self.notes.insert(index, note);
        Ok(true)
    }

    /// Insert directly after the note at `index`.
    pub fn insert_after(&mut self, index: usize, note: Note) -> ContextResult<bool> {
        if index >= self.notes.len() {
            note.validate()?;
            return Ok(false);
        }
        self.insert_at(index + 1, note)
    }

    pub fn update(&mut self, index: usize, note: Note) -> ContextResult<bool> {
        note.validate()?;
        match self.notes.get_mut(index) {
            Some(slot) => {
                *slot = note;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn remove(&mut self, index: usize) -> Option<Note> {
        (index < self.notes.len()).then(|| self.notes.remove(index))
    }

    pub fn move_up(&mut self, index: usize) -> bool {
        if index == 0 || index >= self.notes.len() {
            return false;
        }
        self.notes.swap(index - 1, index);
        true
    }

    pub fn move_down(&mut self, index: usize) -> bool {
        if index + 1 >= self.notes.len() {
            return false;
        }
        self.notes.swap(index, index + 1);
        true
    }

    /// Swap in a whole list. Every note is validated first; on error nothing changes.
    pub fn replace_all(&mut self, notes: Vec<Note>) -> ContextResult<()> {
        for note in &notes {
            note.validate()?;
        }
        self.notes = notes;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.notes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::CoreError;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::error::ContextError;

    fn keyword(title: &str, content: &str, keywords: &[&str]) -> Note {
        Note::new(
            NoteKind::Keyword,
            title,
            content,
            keywords.iter().map(|k| k.to_string()).collect(),
        )
        .unwrap()
    }

    fn moment(title: &str) -> Note {
        Note::new(NoteKind::Moment, title, format!("{title} happened"), vec![]).unwrap()
    }

    fn book(notes: Vec<Note>) -> NoteBook {
        NoteBook::new(notes, NoteSettings::default())
    }

    #[test]
    fn keyword_match_renders_blocks_in_collection_order() {
        let book = book(vec![
            keyword("Blade", "An old sword", &["sword"]),
            keyword("Aria", "A bard", &[]),
            keyword("Castle", "Stone walls", &[]),
        ]);

        assert_eq!(
            book.keyword_match("Aria drew the sword"),
            "【Blade】\nAn old sword\n\n【Aria】\nA bard"
        );
        assert_eq!(book.keyword_match("Blade was drawn"), "");
    }

    #[test]
    fn keyword_match_respects_switch() {
        let mut book = book(vec![keyword("Aria", "A bard", &[])]);
        book.update_settings(NoteSettings {
            keyword_match_enabled: false,
            ..NoteSettings::default()
        });
        assert_eq!(book.keyword_match("Aria"), "");
    }

    #[test]
    fn random_match_only_draws_moments_without_replacement() {
        let book = book(vec![
            keyword("Aria", "A bard", &[]),
            moment("Rain"),
            moment("Fire"),
        ]);
        let mut rng = StdRng::seed_from_u64(7);

        let text = book.random_match(5, &mut rng);
        assert!(text.contains("【Rain】"));
        assert!(text.contains("【Fire】"));
        assert!(!text.contains("Aria"));
        assert_eq!(text.matches('【').count(), 2);

        let one = book.random_match(1, &mut rng);
        assert_eq!(one.matches('【').count(), 1);
    }

    #[test]
    fn random_match_without_moments_is_empty() {
        let book = book(vec![keyword("Aria", "A bard", &[])]);
        assert_eq!(book.random_match(3, &mut StdRng::seed_from_u64(1)), "");
    }

    #[test]
    fn zero_frequency_never_samples() {
        let book = book(vec![moment("Rain")]);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            assert!(!should_sample(0.0, &mut rng));
            assert_eq!(book.matched_text("nothing", 0.0, 1, &mut rng), "");
        }
    }

    #[test]
    fn full_frequency_always_samples() {
        let book = book(vec![moment("Rain")]);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            assert!(should_sample(1.0, &mut rng));
            assert_eq!(
                book.matched_text("nothing", 1.0, 1, &mut rng),
                "【Rain】\nRain happened"
            );
        }
    }

    #[test]
    fn keyword_block_precedes_random_block() {
        let book = book(vec![moment("Rain"), keyword("Aria", "A bard", &[])]);
        let text = book.matched_text("Aria sings", 1.0, 1, &mut StdRng::seed_from_u64(3));
        assert_eq!(text, "【Aria】\nA bard\n\n【Rain】\nRain happened");
    }

    #[test]
    fn same_seed_gives_same_draw() {
        let book = book((0..10).map(|i| moment(&format!("M{i}"))).collect());
        let a = book.random_match(3, &mut StdRng::seed_from_u64(99));
        let b = book.random_match(3, &mut StdRng::seed_from_u64(99));
        assert_eq!(a, b);
    }

    #[test]
    fn always_send_lists_first_lines() {
        let mut book = book(vec![
            keyword("Aria", "A bard\nShe travels alone.", &[]),
            moment("Rain"),
        ]);
        assert_eq!(
            book.always_send_summary(),
            "Aria：A bard\nRain：Rain happened"
        );

        book.update_settings(NoteSettings {
            always_send_enabled: false,
            ..NoteSettings::default()
        });
        assert_eq!(book.always_send_summary(), "");
    }

    #[test]
    fn always_send_skips_empty_first_lines() {
        let book = book(vec![keyword("Gap", "\nSecond line only", &[])]);
        assert_eq!(book.always_send_summary(), "");
    }

    #[test]
    fn always_send_keeps_whitespace_first_lines() {
        let book = book(vec![
            keyword("Gap", "\nSecond line only", &[]),
            keyword("Pad", "  \nIndented below", &[]),
        ]);
        assert_eq!(book.always_send_summary(), "Pad：  ");
    }

    #[test]
    fn mutations_reject_out_of_range_indices() {
        let mut book = book(vec![moment("A"), moment("B")]);

        assert!(!book.update(5, moment("X")).unwrap());
        assert!(book.remove(2).is_none());
        assert!(!book.move_up(0));
        assert!(!book.move_down(1));
        assert!(!book.insert_at(3, moment("X")).unwrap());
        assert!(!book.insert_after(2, moment("X")).unwrap());
        assert_eq!(book.len(), 2);
    }

    #[test]
    fn reorder_and_insert_after() {
        let mut book = book(vec![moment("A"), moment("B"), moment("C")]);

        assert!(book.move_down(0));
        assert!(book.move_up(2));
        assert!(book.insert_after(0, moment("D")).unwrap());

        let titles: Vec<&str> = book.notes().iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["B", "D", "C", "A"]);
        assert_eq!(book.remove(1).map(|n| n.title), Some("D".to_string()));
    }

    #[test]
    fn add_and_update_validate() {
        let mut book = book(vec![]);
        let mut invalid = moment("A");
        invalid.content = " ".to_string();

        let err = book.add(invalid.clone()).unwrap_err();
        assert!(matches!(
            err,
            ContextError::Validation(CoreError::EmptyField { field: "content" })
        ));
        assert_eq!(book.add(moment("A")).unwrap(), 0);
        assert!(book.update(0, invalid).is_err());
        assert_eq!(book.get(0).unwrap().content, "A happened");
    }

    #[test]
    fn replace_all_is_atomic() {
        let mut book = book(vec![moment("A")]);
        let mut invalid = moment("B");
        invalid.title.clear();

        assert!(book.replace_all(vec![moment("X"), invalid]).is_err());
        assert_eq!(book.notes(), &[moment("A")]);

        book.replace_all(vec![moment("X")]).unwrap();
        assert_eq!(book.notes(), &[moment("X")]);
    }
}
