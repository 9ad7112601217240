//! Ordered, short-circuiting request steps.
//!
//! Each step receives the context produced by the previous one and either
//! continues with it or breaks. The pipeline itself never emits anything;
//! a step that breaks is responsible for reporting its own failure.

use std::future::Future;
use std::ops::ControlFlow;

use futures::future::BoxFuture;

type Step<C> = Box<dyn FnOnce(C) -> BoxFuture<'static, ControlFlow<(), C>> + Send>;

pub struct StepPipeline<C> {
    steps: Vec<Step<C>>,
}

impl<C: Send + 'static> Default for StepPipeline<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Send + 'static> StepPipeline<C> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Appends a step.
    pub fn step<F, Fut>(mut self, step: F) -> Self
    where
        F: FnOnce(C) -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<(), C>> + Send + 'static,
    {
        self.steps.push(Box::new(move |ctx| Box::pin(step(ctx))));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs the steps in order on the calling task.
    ///
    /// Returns the final context when every step continued, or `None` as soon
    /// as one step breaks. Steps after a break never run.
    pub async fn run(self, mut ctx: C) -> Option<C> {
        for step in self.steps {
            match step(ctx).await {
                ControlFlow::Continue(next) => ctx = next,
                ControlFlow::Break(()) => return None,
            }
        }
        Some(ctx)
    }
}
