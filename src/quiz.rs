//! Quiz model and answer checking
//!
//! Pure data and logic, no I/O. A [`Quiz`] is treated as an immutable
//! snapshot once it has been published to attendees.

use crate::types::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

pub type QuizId = u64;
pub type AnswerId = u64;

static LAST_QUIZ_ID: AtomicU64 = AtomicU64::new(0);

/// Next quiz id: milliseconds since the epoch, bumped when two quizzes are
/// created within the same millisecond so ids stay strictly increasing.
pub fn next_quiz_id() -> QuizId {
    let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let mut last = LAST_QUIZ_ID.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last + 1);
        match LAST_QUIZ_ID.compare_exchange_weak(
            last,
            candidate,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return candidate,
            Err(actual) => last = actual,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuizError {
    #[error("Quiz question can not be empty")]
    EmptyQuestion,

    #[error("Quiz {0} has no answers")]
    NoAnswers(QuizId),

    #[error("Quiz {0} has no correct answer")]
    NoCorrectAnswer(QuizId),

    #[error("Quiz {quiz_id} has duplicate answer id {answer_id}")]
    DuplicateAnswer { quiz_id: QuizId, answer_id: AnswerId },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Question {
    pub id: u64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Answer {
    pub id: AnswerId,
    pub text: String,
    #[serde(default)]
    pub correct: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quiz {
    pub id: QuizId,
    pub question: Question,
    pub answers: Vec<Answer>,
}

impl Quiz {
    /// Create an empty quiz with a fresh id
    pub fn new(question: impl Into<String>) -> Self {
        let id = next_quiz_id();
        Self {
            id,
            question: Question {
                id,
                text: question.into(),
            },
            answers: Vec::new(),
        }
    }

    /// Append an answer; ids are assigned in insertion order starting at 1
    pub fn with_answer(mut self, text: impl Into<String>, correct: bool) -> Self {
        let id = self.answers.iter().map(|a| a.id).max().unwrap_or(0) + 1;
        self.answers.push(Answer {
            id,
            text: text.into(),
            correct,
        });
        self
    }

    pub fn correct_answer_ids(&self) -> BTreeSet<AnswerId> {
        self.answers
            .iter()
            .filter(|a| a.correct)
            .map(|a| a.id)
            .collect()
    }

    /// Exact-match scoring: the given ids must be precisely the set of
    /// correct answer ids. No partial credit, order is irrelevant.
    pub fn check_answers<I>(&self, given: I) -> bool
    where
        I: IntoIterator<Item = AnswerId>,
    {
        let given: BTreeSet<AnswerId> = given.into_iter().collect();
        given == self.correct_answer_ids()
    }

    pub fn validate(&self) -> Result<(), QuizError> {
        if self.question.text.trim().is_empty() {
            return Err(QuizError::EmptyQuestion);
        }
        if self.answers.is_empty() {
            return Err(QuizError::NoAnswers(self.id));
        }

        let mut seen = HashSet::new();
        for answer in &self.answers {
            if !seen.insert(answer.id) {
                return Err(QuizError::DuplicateAnswer {
                    quiz_id: self.id,
                    answer_id: answer.id,
                });
            }
        }

        if !self.answers.iter().any(|a| a.correct) {
            return Err(QuizError::NoCorrectAnswer(self.id));
        }
        Ok(())
    }

    /// What attendees get to see: answers without their verdict
    pub fn attendee_view(&self) -> AttendeeQuiz {
        AttendeeQuiz {
            id: self.id,
            question: self.question.clone(),
            answers: self
                .answers
                .iter()
                .map(|a| AttendeeAnswer {
                    id: a.id,
                    text: a.text.clone(),
                })
                .collect(),
            correct_answers: self.answers.iter().filter(|a| a.correct).count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttendeeAnswer {
    pub id: AnswerId,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttendeeQuiz {
    pub id: QuizId,
    pub question: Question,
    pub answers: Vec<AttendeeAnswer>,
    /// How many answers must be selected; lets the client pick between a
    /// radio group and checkboxes
    pub correct_answers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuizSubmission {
    pub quiz_id: QuizId,
    pub session_id: SessionId,
    pub selected_answer_ids: BTreeSet<AnswerId>,
    pub submitted_at: String,
}

/// Aggregated results of the active quiz, one verdict per session
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QuizTally {
    pub quiz_id: QuizId,
    pub correct: u32,
    pub incorrect: u32,
    pub entries: BTreeMap<SessionId, bool>,
    #[serde(default)]
    pub closed: bool,
}

impl QuizTally {
    pub fn new(quiz_id: QuizId) -> Self {
        Self {
            quiz_id,
            ..Self::default()
        }
    }

    /// Record (or replace) the verdict for one session
    pub fn record(&mut self, session_id: SessionId, correct: bool) {
        self.entries.insert(session_id, correct);
        self.correct = self.entries.values().filter(|c| **c).count() as u32;
        self.incorrect = self.entries.len() as u32 - self.correct;
    }

    pub fn total(&self) -> u32 {
        self.correct + self.incorrect
    }
}
