mod dispatcher;
mod executor;
mod scheduler;
mod workflows;
