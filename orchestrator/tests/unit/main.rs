mod fakes;
mod test_api;
mod test_application;
mod test_infra;
