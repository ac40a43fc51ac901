use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write};

use itertools::Itertools;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{add_ref, remove_ref, ExchangeRouter, ExchangeType, RoutableMessage, TOPIC};
use crate::binding::BindingKey;
use crate::types::{HashMap, QueueName};

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub enum Word {
    Normal(String),
    SingleWildcard, // *
    MultiWildcard,  // #
}

impl Word {
    #[inline]
    pub fn value(&self) -> Option<&str> {
        match self {
            Word::Normal(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        !matches!(self, Word::Normal(_))
    }
}

impl From<&str> for Word {
    #[inline]
    fn from(s: &str) -> Self {
        match s {
            "*" => Word::SingleWildcard,
            "#" => Word::MultiWildcard,
            _ => Word::Normal(s.to_owned()),
        }
    }
}

impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Word::Normal(s) => f.write_str(s),
            Word::SingleWildcard => f.write_char('*'),
            Word::MultiWildcard => f.write_char('#'),
        }
    }
}

/// `.`-separated binding pattern. `*` matches exactly one word, `#` zero or more,
/// at any position.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub struct TopicPattern(Vec<Word>);

impl TopicPattern {
    pub fn parse<S: AsRef<str>>(pattern: S) -> Self {
        let mut words: Vec<Word> = Vec::new();
        for w in pattern.as_ref().split('.') {
            let w = Word::from(w);
            //a run of # is the same as one
            if w == Word::MultiWildcard && words.last() == Some(&Word::MultiWildcard) {
                continue;
            }
            words.push(w);
        }
        TopicPattern(words)
    }

    #[inline]
    pub fn words(&self) -> &[Word] {
        &self.0
    }

    #[inline]
    pub fn has_wildcards(&self) -> bool {
        self.0.iter().any(|w| w.is_wildcard())
    }

    pub fn matches_str<S: AsRef<str> + ?Sized>(&self, routing_key: &S) -> bool {
        let words: Vec<&str> = routing_key.as_ref().split('.').collect();
        matches(&self.0, &words)
    }
}

/// Backtracks only over the position of the last `#` seen.
fn matches(pattern: &[Word], words: &[&str]) -> bool {
    let (mut p, mut w) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while w < words.len() {
        match pattern.get(p) {
            Some(Word::MultiWildcard) => {
                star = Some((p, w));
                p += 1;
            }
            Some(Word::SingleWildcard) => {
                p += 1;
                w += 1;
            }
            Some(Word::Normal(s)) if s == words[w] => {
                p += 1;
                w += 1;
            }
            _ => match star {
                Some((sp, sw)) => {
                    p = sp + 1;
                    w = sw + 1;
                    star = Some((sp, sw + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|word| *word == Word::MultiWildcard)
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.iter().join("."))
    }
}

pub struct TopicExchangeType;

impl ExchangeType for TopicExchangeType {
    fn name(&self) -> &'static str {
        TOPIC
    }

    fn new_router(&self) -> Box<dyn ExchangeRouter> {
        Box::<TopicRouter>::default()
    }
}

#[derive(Default)]
struct TopicRouter {
    patterns: RwLock<HashMap<String, (TopicPattern, BTreeMap<QueueName, usize>)>>,
}

impl ExchangeRouter for TopicRouter {
    fn add_binding(&self, key: &BindingKey) {
        let mut patterns = self.patterns.write();
        let (_, queues) = patterns
            .entry(key.key.to_string())
            .or_insert_with(|| (TopicPattern::parse(&*key.key), Default::default()));
        add_ref(queues, &key.queue);
    }

    fn remove_binding(&self, key: &BindingKey) {
        let mut patterns = self.patterns.write();
        if let Some((_, queues)) = patterns.get_mut(&*key.key) {
            remove_ref(queues, &key.queue);
            if queues.is_empty() {
                patterns.remove(&*key.key);
            }
        }
    }

    fn route(&self, message: &RoutableMessage<'_>) -> BTreeSet<QueueName> {
        let words: Vec<&str> = message.routing_key.split('.').collect();
        self.patterns
            .read()
            .values()
            .filter(|(pattern, _)| matches(&pattern.0, &words))
            .flat_map(|(_, queues)| queues.keys().cloned())
            .collect()
    }

    fn binding_count(&self) -> usize {
        self.patterns.read().values().map(|(_, q)| q.values().sum::<usize>()).sum()
    }
}
