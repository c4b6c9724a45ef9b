//! Downstream position hand-off
//!
//! Decoders must never block on consumers, so positions go through a
//! bounded channel. The sender side is cheap to clone; the consumer owns
//! the receiver and processes at its own pace.

use geolink_types::Position;
use tokio::sync::mpsc;

#[derive(Clone, Debug)]
pub struct PositionPipeline {
    sender: mpsc::Sender<Position>,
}

impl PositionPipeline {
    pub fn new(queue_size: usize) -> (Self, mpsc::Receiver<Position>) {
        let (sender, receiver) = mpsc::channel(queue_size);
        (Self { sender }, receiver)
    }

    /// Forwards one position. Per-device ordering is preserved because each
    /// connection worker forwards its own positions sequentially.
    pub async fn forward(&self, position: Position) {
        if self.sender.send(position).await.is_err() {
            tracing::warn!("position consumer is gone, dropping position");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn it_preserves_order() {
        let (pipeline, mut receiver) = PositionPipeline::new(8);

        for index in 0..3i64 {
            let mut position = Position::new("test");
            position.set("index", index);
            pipeline.forward(position).await;
        }

        for expected in 0..3i64 {
            let position = receiver.recv().await.unwrap();
            assert_eq!(position.get("index").unwrap().as_i64(), Some(expected));
        }
    }
}
