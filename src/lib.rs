pub mod a01;
pub mod cloud;
pub mod codes;
pub mod commands;
pub mod coordinator;
pub mod credentials;
pub mod homie;
pub mod integration;
pub mod output;
pub mod protocol;
pub mod sensor;
pub mod session;
pub mod status_client;
