mod app_tests;
mod state_tests;
