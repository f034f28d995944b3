pub mod api;
pub mod db;
pub mod monitor_webhook;
pub mod router_rest;
