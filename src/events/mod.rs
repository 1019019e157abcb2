use async_trait::async_trait;
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entities::{CashbackStatus, OrderStatus, PaymentStatus};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender together with the receiving end of a bounded channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event after the triggering write is committed. Delivery failures are logged only.
    pub async fn publish(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "Dropping domain event");
        }
    }
}

/// Facts emitted once the corresponding transaction has committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        user_id: Uuid,
        total_amount: Decimal,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    PaymentCreated {
        payment_id: Uuid,
        order_id: Uuid,
    },
    PaymentStatusChanged {
        payment_id: Uuid,
        order_id: Option<Uuid>,
        old_status: PaymentStatus,
        new_status: PaymentStatus,
    },
    CashbackCreated {
        cashback_id: Uuid,
        payment_id: Uuid,
        amount: Decimal,
    },
    CashbackStatusChanged {
        cashback_id: Uuid,
        old_status: CashbackStatus,
        new_status: CashbackStatus,
    },
}

impl Event {
    /// Stable name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::OrderStatusChanged { .. } => "order_status_changed",
            Event::PaymentCreated { .. } => "payment_created",
            Event::PaymentStatusChanged { .. } => "payment_status_changed",
            Event::CashbackCreated { .. } => "cashback_created",
            Event::CashbackStatusChanged { .. } => "cashback_status_changed",
        }
    }
}

// Handlers receive every event. A failing handler does not affect the others.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: Event) -> Result<(), String>;
}

/// Drains `rx` until every sender is dropped, fanning each event out to `handlers`.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Arc<dyn EventHandler>>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        info!(event = event.name(), payload = ?event, "Received event");
        metrics::counter!("stateset_events.received", 1, "event" => event.name());

        let results = join_all(handlers.iter().map(|h| h.handle_event(event.clone()))).await;
        for result in results {
            if let Err(e) = result {
                error!(event = event.name(), error = %e, "Event handler failed");
            }
        }
    }

    info!("Event channel closed, stopping event processing");
}
