//! Emit stage: hand the final target set to the lifecycle manager.

use crate::lifecycle::LifecycleWriter;
use crate::pipeline::{Stage, StageOutcome, TickContext, TickDeadline};
use async_trait::async_trait;
use std::sync::Arc;

pub struct EmitStage {
    writer: Arc<LifecycleWriter>,
}

impl EmitStage {
    pub fn new(writer: Arc<LifecycleWriter>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl Stage for EmitStage {
    fn name(&self) -> &'static str {
        "emit"
    }

    async fn run(&self, cx: &mut TickContext, deadline: &TickDeadline) -> StageOutcome {
        self.writer
            .apply(
                &cx.symbol,
                cx.tick_index,
                cx.mid,
                cx.bid.take(),
                cx.ask.take(),
                cx.cancel_all_required,
                deadline,
            )
            .await;
        StageOutcome::Ok
    }
}
