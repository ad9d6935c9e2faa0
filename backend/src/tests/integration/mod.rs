// End-to-end engine tests against in-memory stores

mod api;
mod enrollment_lifecycle;
mod scenarios;
