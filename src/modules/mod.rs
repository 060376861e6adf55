pub mod chat;
pub mod conversation;
pub mod deep_research;
pub mod research_plan;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;
