//! Steps, scenarios and the control combinators.
//!
//! A [`Scenario`] runs its steps in order over one [`Params`] and stops at
//! the first error. Every step whose `run` succeeded is then cleaned up
//! exactly once, in reverse order, before the scenario's own `run` returns.
//! A step whose `run` fails is not cleaned up, so it must undo any partial
//! setup before returning the error.
//!
//! Because a scenario tears itself down, it can be nested and repeated like
//! any other step.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{Params, Result};

/// A unit of scenario execution.
#[async_trait]
pub trait Step: Send {
    /// Perform the step.
    async fn run(&mut self, params: &mut Params) -> Result<()>;

    /// Undo whatever `run` set up. Best effort; never fails.
    async fn cleanup(&mut self) {}
}

/// An ordered list of steps with undo-stack cleanup.
#[derive(Default)]
pub struct Scenario {
    steps: Vec<Box<dyn Step>>,
    done: usize,
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("steps", &self.steps.len())
            .field("done", &self.done)
            .finish()
    }
}

impl Scenario {
    /// Create an empty scenario.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step.
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Append an already boxed step.
    pub fn boxed(mut self, step: Box<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether there are no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run all steps, consuming the scenario.
    pub async fn execute(mut self, params: &mut Params) -> Result<()> {
        self.run(params).await
    }

    async fn unwind(&mut self) {
        while self.done > 0 {
            self.done -= 1;
            debug!(step = self.done, "cleaning up step");
            self.steps[self.done].cleanup().await;
        }
    }
}

#[async_trait]
impl Step for Scenario {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        self.unwind().await;

        let mut result = Ok(());
        for index in 0..self.steps.len() {
            debug!(step = index, "running step");
            if let Err(err) = self.steps[index].run(params).await {
                warn!(step = index, error = %err, "step failed, unwinding");
                result = Err(err);
                break;
            }
            self.done = index + 1;
        }

        self.unwind().await;
        result
    }

    async fn cleanup(&mut self) {
        self.unwind().await;
    }
}

/// Pause the scenario.
#[derive(Debug, Clone, Copy)]
pub struct Sleep(pub Duration);

#[async_trait]
impl Step for Sleep {
    async fn run(&mut self, _params: &mut Params) -> Result<()> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

/// How long a [`Repeat`] keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repetition {
    /// A fixed number of iterations.
    Times(usize),
    /// Iterations keep starting until this much time has passed.
    For(Duration),
}

/// Run a step repeatedly, stopping at the first error.
///
/// `params.n` holds the iteration number during each run. The inner step
/// is cleaned up once, after the last iteration.
pub struct Repeat {
    repetition: Repetition,
    step: Box<dyn Step>,
    ran: bool,
}

impl fmt::Debug for Repeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repeat")
            .field("repetition", &self.repetition)
            .finish_non_exhaustive()
    }
}

impl Repeat {
    /// Run `step` exactly `n` times.
    pub fn times(n: usize, step: impl Step + 'static) -> Self {
        Self::new(Repetition::Times(n), Box::new(step))
    }

    /// Run `step` back to back until `duration` has elapsed.
    pub fn lasting(duration: Duration, step: impl Step + 'static) -> Self {
        Self::new(Repetition::For(duration), Box::new(step))
    }

    /// Create from a repetition and a boxed step.
    pub fn new(repetition: Repetition, step: Box<dyn Step>) -> Self {
        Self {
            repetition,
            step,
            ran: false,
        }
    }

    async fn iterate(&mut self, n: usize, params: &mut Params) -> Result<()> {
        params.n = n;
        let result = self.step.run(params).await;
        if result.is_ok() {
            self.ran = true;
        }
        result
    }
}

#[async_trait]
impl Step for Repeat {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        let saved = params.n;
        let result = match self.repetition {
            Repetition::Times(count) => {
                let mut result = Ok(());
                for n in 0..count {
                    result = self.iterate(n, params).await;
                    if result.is_err() {
                        break;
                    }
                }
                result
            }
            Repetition::For(duration) => {
                let start = Instant::now();
                let mut n = 0;
                let mut result = Ok(());
                while start.elapsed() < duration {
                    result = self.iterate(n, params).await;
                    if result.is_err() {
                        break;
                    }
                    n += 1;
                }
                debug!(iterations = n, "repeat finished");
                result
            }
        };
        params.n = saved;
        result
    }

    async fn cleanup(&mut self) {
        if std::mem::take(&mut self.ran) {
            self.step.cleanup().await;
        }
    }
}

/// Run `back` in the background while `fore` runs in the foreground.
///
/// `back` works on a clone of the params, so it shares the variable store but
/// not the `n` counter. If `fore` fails, `back` is cancelled and `fore`'s error
/// is returned; the fork can then be run again. Otherwise the fork waits for `back` to finish its own bounded
/// run and returns its result. Only `fore` is cleaned up; `back` is expected
/// to be a stateless repetition such as a rolling config update.
pub struct Fork {
    fore: Box<dyn Step>,
    back: Option<Box<dyn Step>>,
}

impl fmt::Debug for Fork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fork")
            .field("back_pending", &self.back.is_some())
            .finish_non_exhaustive()
    }
}

impl Fork {
    /// Create a fork.
    pub fn new(fore: impl Step + 'static, back: impl Step + 'static) -> Self {
        Self {
            fore: Box::new(fore),
            back: Some(Box::new(back)),
        }
    }
}

#[async_trait]
impl Step for Fork {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        let mut back = self
            .back
            .take()
            .ok_or(crate::Error::NotStarted("fork background step already consumed"))?;
        let mut back_params = params.clone();
        let (cancel, cancelled) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let result = tokio::select! {
                result = back.run(&mut back_params) => Some(result),
                _ = cancelled => None,
            };
            (back, result)
        });

        // Dropping the sender cancels too, so it lives until `back` is joined.
        let mut cancel = Some(cancel);
        let fore = self.fore.run(params).await;
        if let Err(err) = &fore {
            info!(error = %err, "foreground failed, cancelling background step");
            if let Some(cancel) = cancel.take() {
                let _ = cancel.send(());
            }
        }
        let joined = handle.await;
        drop(cancel);

        let (back, result) = match joined {
            Ok(done) => done,
            Err(join) => {
                return Err(crate::Error::Other(format!("background step panicked: {join}")))
            }
        };
        self.back = Some(back);
        fore?;
        result.unwrap_or_else(|| Err(crate::Error::Other("background step cancelled".into())))
    }

    async fn cleanup(&mut self) {
        self.fore.cleanup().await;
    }
}

/// Adapt a closure into a step.
pub struct StepFn<F> {
    f: F,
}

impl<F> fmt::Debug for StepFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StepFn")
    }
}

impl<F> StepFn<F>
where
    F: FnMut(&mut Params) -> Result<()> + Send,
{
    /// Wrap `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Step for StepFn<F>
where
    F: FnMut(&mut Params) -> Result<()> + Send,
{
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        (self.f)(params)
    }
}
