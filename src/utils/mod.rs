mod thread;

pub(crate) use thread::{get_current_thread_name, set_current_thread_name};
