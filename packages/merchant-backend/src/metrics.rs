//! Prometheus metrics for the merchant backend, exposed on /metrics.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_int_counter, CounterVec, Gauge, IntCounter,
};

lazy_static! {
    pub static ref UP: Gauge = register_gauge!(
        "merchant_up",
        "1 while the backend is serving requests"
    )
    .unwrap();

    // Order lifecycle
    pub static ref ORDERS_CREATED: IntCounter = register_int_counter!(
        "merchant_orders_created_total",
        "Orders accepted from the front-end"
    )
    .unwrap();

    pub static ref PROPOSALS_SIGNED: IntCounter = register_int_counter!(
        "merchant_proposals_signed_total",
        "Orders promoted to signed contract terms"
    )
    .unwrap();

    pub static ref PAYMENTS_COMPLETED: IntCounter = register_int_counter!(
        "merchant_payments_completed_total",
        "Contracts that reached the paid state"
    )
    .unwrap();

    // Exchange traffic
    pub static ref DEPOSITS_SUBMITTED: CounterVec = register_counter_vec!(
        "merchant_deposits_submitted_total",
        "Coin deposits submitted to exchanges",
        &["exchange", "status"]
    )
    .unwrap();

    pub static ref KEYS_FETCH_FAILURES: CounterVec = register_counter_vec!(
        "merchant_exchange_keys_failures_total",
        "Failed /keys fetches per exchange",
        &["exchange"]
    )
    .unwrap();

    // Refunds and tips
    pub static ref REFUNDS_RECORDED: IntCounter = register_int_counter!(
        "merchant_refunds_recorded_total",
        "Refund rows recorded"
    )
    .unwrap();

    pub static ref TIPS_AUTHORIZED: IntCounter = register_int_counter!(
        "merchant_tips_authorized_total",
        "Tip authorizations granted"
    )
    .unwrap();

    pub static ref TIPS_PICKED_UP: IntCounter = register_int_counter!(
        "merchant_tip_pickups_total",
        "Tip pickups serviced (including idempotent replays)"
    )
    .unwrap();

    // Long polling
    pub static ref LONGPOLL_SUSPENDED: Gauge = register_gauge!(
        "merchant_longpoll_suspended",
        "Requests currently parked on the long-poll registry"
    )
    .unwrap();
}
