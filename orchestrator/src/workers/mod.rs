pub mod dispatcher;
pub mod outcomes;
pub mod reconciler;
