//! Curated word lists for passphrases and memorable pairing codes.
//!
//! Short, unambiguous, easy to read aloud over the phone. No homophones
//! (e.g. "night"/"knight") and no words that differ by one letter.

pub const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brave", "bright", "calm", "cedar", "clever", "cobalt",
    "copper", "coral", "crisp", "eager", "early", "fancy", "fleet", "gentle",
    "golden", "grand", "happy", "hardy", "hidden", "humble", "ivory", "jade",
    "keen", "kind", "lively", "lucky", "lunar", "mellow", "merry", "misty",
    "noble", "olive", "plucky", "proud", "quick", "quiet", "rapid", "royal",
    "rustic", "scarlet", "silent", "silver", "solar", "steady", "sunny", "swift",
    "tidy", "vivid", "warm", "wild", "winter", "witty", "young", "zesty",
];

pub const NOUNS: &[&str] = &[
    "anchor", "aspen", "badger", "beacon", "birch", "bison", "breeze", "brook",
    "canyon", "cedar", "comet", "condor", "cougar", "crane", "delta", "dune",
    "eagle", "ember", "falcon", "fern", "fjord", "garnet", "geyser", "glacier",
    "harbor", "hawk", "heron", "island", "jaguar", "lagoon", "lark", "lynx",
    "maple", "meadow", "meteor", "orca", "osprey", "otter", "pebble", "pine",
    "prairie", "puffin", "raven", "reef", "ridge", "river", "sparrow", "summit",
    "thicket", "tiger", "trail", "tundra", "walrus", "willow", "wren", "zephyr",
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn word_lists_have_no_duplicates() {
        let adj: HashSet<_> = ADJECTIVES.iter().collect();
        let nouns: HashSet<_> = NOUNS.iter().collect();
        assert_eq!(adj.len(), ADJECTIVES.len());
        assert_eq!(nouns.len(), NOUNS.len());
    }
}
