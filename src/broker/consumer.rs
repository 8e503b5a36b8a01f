// src/broker/consumer.rs

//! Consumer dispatch loop.
//!
//! One spawned task per consumer registration. The loop cycles through
//! three states: idle (just finished a delivery), waiting (parked on the
//! queue's notify until a message or an in-flight slot frees up), and
//! dispatching (handler running to completion). Removal of the consumer's
//! flow entry is the stop signal; the loop observes it on its next claim
//! attempt and exits for good.
//!
//! The handler runs to completion before the next claim, so a slow
//! handler blocks only its own consumer, up to its prefetch bound.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::broker::queue::{Claim, Queue};
use crate::broker::SessionInner;
use crate::{AckMode, Delivery, DeliveryHandler, Outcome};

pub(crate) fn spawn_dispatch_loop(
    session: Arc<SessionInner>,
    queue: Arc<Queue>,
    consumer_tag: Arc<str>,
    wake: Arc<Notify>,
    handler: DeliveryHandler,
) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        loop {
            match queue.try_claim(&consumer_tag, || session.allocate_tag()) {
                Claim::Delivery {
                    tag,
                    message,
                    ack_mode,
                } => {
                    // ---
                    // Manual deliveries become settleable before the
                    // handler ever sees the tag.
                    if ack_mode == AckMode::Manual {
                        session.register_tag(tag, queue.name.clone(), consumer_tag.clone());
                    }

                    let delivery = Delivery {
                        delivery_tag: tag,
                        queue: queue.name.clone(),
                        message,
                    };

                    let outcome = (handler)(delivery).await;

                    if ack_mode == AckMode::Manual {
                        let settled = match outcome {
                            Outcome::Ack => session.ack_tag(tag),
                            Outcome::Nack => session.nack_tag(tag),
                            Outcome::Settled => Ok(()),
                        };
                        if let Err(err) = settled {
                            // Tag already requeued by a concurrent cancel,
                            // or settled by the handler despite returning
                            // Ack/Nack. Reported, not fatal.
                            crate::log_warn!("consumer {consumer_tag}: settle failed: {err}");
                        }
                    }
                }
                Claim::Wait => wake.notified().await,
                Claim::Stopped => break,
            }
        }

        crate::log_debug!("consumer {consumer_tag} stopped");
    })
}
