//! Handler contract and the panic guard around it.
//!
//! A handler never fails with a Rust error. Whatever happens, it produces a
//! result document whose `job_error` tells the queue server how the job ended.
//! [`run_guarded`] converts a panic into a `job-panicked` error carrying the
//! panic message, the last error the handler recorded and a backtrace.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::Once;

use async_trait::async_trait;
use futures::FutureExt;
use osbuild_worker_api::ClientError;
use osbuild_worker_api::ErrorCode;
use osbuild_worker_api::JobKind;
use osbuild_worker_api::JobResult;
use osbuild_worker_api::JobResultEnvelope;
use osbuild_worker_client::Job;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// A claimed job plus its cancellation signal.
#[derive(Debug)]
pub struct JobContext {
    job: Job,
    canceled: CancellationToken,
    last_error: Mutex<Option<ClientError>>,
}

impl JobContext {
    pub fn new(job: Job, canceled: CancellationToken) -> Self {
        Self {
            job,
            canceled,
            last_error: Mutex::new(None),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn id(&self) -> Uuid {
        self.job.id()
    }

    pub fn kind(&self) -> JobKind {
        self.job.kind()
    }

    /// Fires when the queue server reports the job as canceled.
    pub fn canceled(&self) -> &CancellationToken {
        &self.canceled
    }

    /// Decode the job arguments, mapping failure to `parsing-job-args`.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        self.job.args().map_err(|e| {
            ClientError::new(
                ErrorCode::PARSING_JOB_ARGS,
                format!("Error parsing arguments: {e}"),
            )
        })
    }

    /// Fetch and decode the result of dependency `index`; any failure is `parsing-dynamic-args` with `reason`.
    pub async fn dependency<T: DeserializeOwned>(&self, index: usize, reason: &str) -> Result<T, ClientError> {
        self.job.dependency_result(index).await.map_err(|e| {
            ClientError::with_details(ErrorCode::PARSING_DYNAMIC_ARGS, reason, e.to_string())
        })
    }

    /// Record `error` on `result` and remember it for the panic guard.
    pub fn fail<R: JobResultEnvelope>(&self, result: &mut R, error: ClientError) {
        *self.last_error.lock() = Some(error.clone());
        result.set_job_error(error);
    }

    /// The most recent error passed to [`fail`](Self::fail).
    pub fn last_error(&self) -> Option<ClientError> {
        self.last_error.lock().clone()
    }

    /// Publish a partial result. Failures are logged and otherwise ignored.
    pub async fn update<R: Serialize + JobResultEnvelope + Sync>(&self, result: &R) {
        if let Some(err) = result.job_error() {
            *self.last_error.lock() = Some(err.clone());
        }
        if let Err(e) = self.job.update(result).await {
            warn!(job_id = %self.id(), error = %e, "failed to update job");
        }
    }
}

/// What a handler hands back to the lane.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub result: Value,
    pub job_error: Option<ClientError>,
}

impl Outcome {
    pub fn from_result<R: Serialize + JobResultEnvelope>(result: &R) -> Self {
        let job_error = result.job_error().cloned();
        let result = match serde_json::to_value(result) {
            Ok(value) => value,
            Err(e) => {
                let err = ClientError::new(ErrorCode::BUILD_JOB, format!("failed to encode job result: {e}"));
                return Self::failed(err);
            }
        };
        Self { result, job_error }
    }

    /// Envelope carrying only an error.
    pub fn failed(error: ClientError) -> Self {
        let envelope = JobResult {
            job_error: Some(error.clone()),
        };
        Self {
            result: serde_json::to_value(&envelope).unwrap_or(Value::Null),
            job_error: Some(error),
        }
    }
}

/// Runs one kind of job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> Outcome;
}

/// Handlers with a typed result that start from its default.
///
/// An `Err` from [`execute`](TypedHandler::execute) becomes the result's
/// `job_error`; everything already written into the result is kept.
#[async_trait]
pub trait TypedHandler: Send + Sync {
    type Output: Default + Serialize + JobResultEnvelope + Send + Sync;

    async fn execute(&self, ctx: &JobContext, result: &mut Self::Output) -> Result<(), ClientError>;
}

#[async_trait]
impl<H: TypedHandler> JobHandler for H {
    async fn run(&self, ctx: &JobContext) -> Outcome {
        let mut result = H::Output::default();
        if let Err(err) = self.execute(ctx, &mut result).await {
            ctx.fail(&mut result, err);
        }
        Outcome::from_result(&result)
    }
}

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a hook that stashes the backtrace of the panicking thread.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Build the `job-panicked` error.
pub fn panicked_error(message: &str, original: Option<&ClientError>, backtrace: Option<String>) -> ClientError {
    let original = match original {
        Some(err) => err.to_string(),
        None => "none".to_string(),
    };
    let reason = format!("job panicked:\n{message}\n\noriginal error:\n{original}");
    match backtrace {
        Some(trace) => ClientError::with_details(ErrorCode::JOB_PANICKED, reason, trace),
        None => ClientError::new(ErrorCode::JOB_PANICKED, reason),
    }
}

/// Run `handler`, turning a panic into a `job-panicked` outcome.
pub async fn run_guarded(handler: &dyn JobHandler, ctx: &JobContext) -> Outcome {
    install_panic_hook();
    match AssertUnwindSafe(handler.run(ctx)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let backtrace = PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take());
            warn!(job_id = %ctx.id(), kind = %ctx.kind(), panic = %message, "job handler panicked");
            Outcome::failed(panicked_error(&message, ctx.last_error().as_ref(), backtrace))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panicked_error_shape() {
        let original = ClientError::new(ErrorCode::BUILD_JOB, "osbuild build failed");
        let err = panicked_error("boom", Some(&original), Some("trace".into()));
        assert_eq!(err.code, ErrorCode::JOB_PANICKED);
        assert_eq!(
            err.reason,
            "job panicked:\nboom\n\noriginal error:\nosbuild build failed (code 10)"
        );
        assert_eq!(err.details, Some(Value::from("trace")));

        let err = panicked_error("boom", None, None);
        assert!(err.reason.ends_with("original error:\nnone"));
        assert!(err.details.is_none());
    }

    #[test]
    fn test_panic_message_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }

    #[test]
    fn test_failed_outcome_is_an_envelope() {
        let outcome = Outcome::failed(ClientError::new(ErrorCode::INVALID_CONFIG, "no handler"));
        assert_eq!(outcome.result["job_error"]["code"], 17);
        assert_eq!(outcome.job_error.unwrap().code, ErrorCode::INVALID_CONFIG);
    }
}
