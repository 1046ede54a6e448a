//! Topic subscription matching.
//!
//! Topics are `/` separated levels. In a subscription a level of `*`
//! matches any single level, a level ending in `*` matches any level with
//! that prefix, and a final level of `>` matches one or more levels.

/// Check a published topic is well formed.
#[must_use]
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= 250
        && !topic.split('/').any(str::is_empty)
        && !topic.contains(['*', '>'])
}

/// Check a subscription is well formed.
#[must_use]
pub fn is_valid_subscription(subscription: &str) -> bool {
    if subscription.is_empty() || subscription.len() > 250 {
        return false;
    }
    let levels: Vec<&str> = subscription.split('/').collect();
    levels.iter().enumerate().all(|(i, level)| {
        if level.is_empty() {
            return false;
        }
        if *level == ">" {
            return i == levels.len() - 1;
        }
        !level.contains('>') && level.find('*').is_none_or(|pos| pos == level.len() - 1)
    })
}

/// Whether `subscription` attracts messages published on `topic`.
#[must_use]
pub fn matches(subscription: &str, topic: &str) -> bool {
    let mut sub_levels = subscription.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (sub_levels.next(), topic_levels.next()) {
            (Some(">"), Some(_)) => return sub_levels.next().is_none(),
            (Some(pattern), Some(level)) => {
                let ok = pattern
                    .strip_suffix('*')
                    .map_or(pattern == level, |prefix| level.starts_with(prefix));
                if !ok {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}
