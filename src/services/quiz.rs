//! Quiz service
//!
//! The presenter publishes a quiz, attendees submit answers, every accepted
//! submission republishes the running tally on `quiz.results`. Only one quiz
//! is active at a time; anything referring to another quiz id is dropped.

use super::{error_reply, parse_body, Deployment, Service, ServiceContext};
use crate::bus::{handler_fn, Envelope};
use crate::error::{ProtocolError, ServerError};
use crate::quiz::{AnswerId, Quiz, QuizId, QuizSubmission, QuizTally};
use crate::types::{address, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Body of `quiz.submit`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitAnswers {
    pub quiz_id: QuizId,
    pub session_id: SessionId,
    #[serde(default)]
    pub answers: Vec<AnswerId>,
}

/// Body of `quiz.close`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloseQuiz {
    pub quiz_id: QuizId,
}

struct ActiveQuiz {
    quiz: Quiz,
    submissions: HashMap<SessionId, QuizSubmission>,
    tally: QuizTally,
}

#[derive(Default)]
struct QuizBoard {
    active: Option<ActiveQuiz>,
}

#[derive(Clone, Default)]
pub struct QuizService {
    board: Arc<Mutex<QuizBoard>>,
}

impl QuizService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the quiz as active and send it to every attendee
    async fn publish(&self, ctx: &ServiceContext, body: &Value) -> Result<Value, ProtocolError> {
        let quiz: Quiz = parse_body(body)?;
        quiz.validate()
            .map_err(|e| ProtocolError::Validation(e.to_string()))?;

        let (tally, replaced) = {
            let mut board = self.board.lock().await;
            match board.active.as_ref() {
                // Same quiz again: resend it, keep what was collected so far
                Some(active) if active.quiz.id == quiz.id => (active.tally.clone(), None),
                _ => {
                    let replaced = board.active.take().map(|previous| {
                        let mut tally = previous.tally;
                        tally.closed = true;
                        tally
                    });
                    let tally = QuizTally::new(quiz.id);
                    board.active = Some(ActiveQuiz {
                        quiz: quiz.clone(),
                        submissions: HashMap::new(),
                        tally: tally.clone(),
                    });
                    (tally, replaced)
                }
            }
        };

        if let Some(previous) = replaced {
            tracing::info!(
                "Quiz {} replaced by {} before being closed",
                previous.quiz_id,
                quiz.id
            );
            ctx.bus.publish(address::QUIZ_RESULTS, json!(previous));
        }

        let delivered = ctx
            .sessions
            .broadcast(address::QUIZ_PUBLISH, json!(quiz.attendee_view()))
            .await;
        ctx.bus.publish(address::QUIZ_RESULTS, json!(tally));

        tracing::info!("Quiz {} published to {} attendees", quiz.id, delivered);
        Ok(json!({ "quiz_id": quiz.id, "delivered": delivered }))
    }

    /// Record one attendee's answers, replacing an earlier submission
    async fn submit(&self, ctx: &ServiceContext, body: &Value) -> Result<Value, ProtocolError> {
        let request: SubmitAnswers = parse_body(body)?;

        let tally = {
            let mut board = self.board.lock().await;
            let active = board
                .active
                .as_mut()
                .filter(|a| a.quiz.id == request.quiz_id)
                .ok_or(ProtocolError::NotActive(request.quiz_id))?;

            let submission = QuizSubmission {
                quiz_id: request.quiz_id,
                session_id: request.session_id.clone(),
                selected_answer_ids: request.answers.iter().copied().collect(),
                submitted_at: chrono::Utc::now().to_rfc3339(),
            };
            let correct = active
                .quiz
                .check_answers(submission.selected_answer_ids.iter().copied());

            if active
                .submissions
                .insert(request.session_id.clone(), submission)
                .is_some()
            {
                tracing::debug!(
                    "Session {} replaced its answer to quiz {}",
                    request.session_id,
                    request.quiz_id
                );
            }
            active.tally.record(request.session_id.clone(), correct);
            active.tally.clone()
        };

        ctx.bus.publish(address::QUIZ_RESULTS, json!(tally));
        Ok(json!({ "accepted": true, "quiz_id": request.quiz_id }))
    }

    /// Stop accepting answers and discard the quiz
    async fn close(&self, ctx: &ServiceContext, body: &Value) -> Result<Value, ProtocolError> {
        let request: CloseQuiz = parse_body(body)?;

        let mut tally = {
            let mut board = self.board.lock().await;
            match board.active.as_ref() {
                Some(active) if active.quiz.id == request.quiz_id => {}
                _ => return Err(ProtocolError::NotActive(request.quiz_id)),
            }
            board
                .active
                .take()
                .map(|active| active.tally)
                .ok_or(ProtocolError::NoActiveQuiz)?
        };
        tally.closed = true;

        ctx.sessions
            .broadcast(address::QUIZ_CLOSE, json!({ "quiz_id": request.quiz_id }))
            .await;
        ctx.bus.publish(address::QUIZ_RESULTS, json!(tally));

        tracing::info!(
            "Quiz {} closed: {} correct, {} incorrect",
            tally.quiz_id,
            tally.correct,
            tally.incorrect
        );
        Ok(json!(tally))
    }

    async fn current(&self) -> Value {
        let board = self.board.lock().await;
        match board.active.as_ref() {
            Some(active) => json!({ "active": true, "quiz": active.quiz.attendee_view() }),
            None => json!({ "active": false }),
        }
    }
}

/// Log a rejected message and answer the requester, if any
fn finish(envelope: &mut Envelope, result: Result<Value, ProtocolError>) {
    let reply = match result {
        Ok(value) => value,
        Err(err @ ProtocolError::NotActive(_)) | Err(err @ ProtocolError::NoActiveQuiz) => {
            tracing::info!("Dropped {} message: {}", envelope.address, err);
            if envelope.address == address::QUIZ_SUBMIT {
                // Stale answers from slow attendees are expected
                json!({ "accepted": false })
            } else {
                error_reply(&err)
            }
        }
        Err(err) => {
            tracing::warn!("Rejected {} message: {}", envelope.address, err);
            error_reply(&err)
        }
    };

    if envelope.expects_reply() {
        envelope.reply(reply);
    }
}

impl Service for QuizService {
    fn name(&self) -> &str {
        "quiz"
    }

    fn deploy(&self, ctx: &ServiceContext, deployment: &mut Deployment) -> Result<(), ServerError> {
        let (svc, c) = (self.clone(), ctx.clone());
        deployment.register(
            address::QUIZ_PUBLISH,
            handler_fn(move |mut envelope: Envelope| {
                let (svc, c) = (svc.clone(), c.clone());
                async move {
                    let result = svc.publish(&c, &envelope.body).await;
                    finish(&mut envelope, result);
                }
            }),
        )?;

        let (svc, c) = (self.clone(), ctx.clone());
        deployment.register(
            address::QUIZ_SUBMIT,
            handler_fn(move |mut envelope: Envelope| {
                let (svc, c) = (svc.clone(), c.clone());
                async move {
                    let result = svc.submit(&c, &envelope.body).await;
                    finish(&mut envelope, result);
                }
            }),
        )?;

        let (svc, c) = (self.clone(), ctx.clone());
        deployment.register(
            address::QUIZ_CLOSE,
            handler_fn(move |mut envelope: Envelope| {
                let (svc, c) = (svc.clone(), c.clone());
                async move {
                    let result = svc.close(&c, &envelope.body).await;
                    finish(&mut envelope, result);
                }
            }),
        )?;

        let svc = self.clone();
        deployment.register(
            address::QUIZ_CURRENT,
            handler_fn(move |mut envelope: Envelope| {
                let svc = svc.clone();
                async move {
                    let current = svc.current().await;
                    envelope.reply(current);
                }
            }),
        )?;

        Ok(())
    }

    fn undeploy(&self) {
        // Handlers are gone by now, nothing else can hold the lock for long
        if let Ok(mut board) = self.board.try_lock() {
            board.active = None;
        }
    }
}
