// Content sniffing used by the caching policy.

pub mod content;
