//! Property-based tests for prompt splitting

use super::*;
use proptest::prelude::*;

fn arb_prompt() -> impl Strategy<Value = String> {
    (
        "[ \n]{0,2}",
        prop::collection::vec(("[a-zé日本]{1,12}", "[ \t\n]{1,3}"), 0..30),
    )
        .prop_map(|(lead, words)| {
            let mut prompt = lead;
            for (word, space) in words {
                prompt.push_str(&word);
                prompt.push_str(&space);
            }
            prompt
        })
}

proptest! {
    #[test]
    fn prop_parts_reconstruct_prompt(prompt in arb_prompt(), max in 1usize..40) {
        let parts = split(&prompt, max);
        let rebuilt: String = parts.iter().map(PromptPart::raw).collect();
        prop_assert_eq!(rebuilt, prompt);
    }

    #[test]
    fn prop_parts_respect_budget(prompt in arb_prompt(), max in 1usize..40) {
        for part in split(&prompt, max) {
            prop_assert!(part.text.chars().count() <= max);
        }
    }

    #[test]
    fn prop_exactly_one_final_part_and_it_is_last(prompt in arb_prompt(), max in 1usize..40) {
        let parts = split(&prompt, max);
        prop_assert!(!parts.is_empty());
        let finals = parts.iter().filter(|p| p.is_final).count();
        prop_assert_eq!(finals, 1);
        prop_assert!(parts.last().is_some_and(|p| p.is_final));
        for (i, part) in parts.iter().enumerate() {
            prop_assert_eq!(part.index, i + 1);
            prop_assert_eq!(part.total, parts.len());
        }
    }

    #[test]
    fn prop_words_within_budget_are_never_cut(prompt in arb_prompt(), max in 12usize..40) {
        // Generated words are at most 12 characters
        let words: Vec<&str> = prompt.split_whitespace().collect();
        let parts = split(&prompt, max);
        let sent: Vec<String> = parts
            .iter()
            .flat_map(|p| p.text.split_whitespace().map(String::from).collect::<Vec<_>>())
            .collect();
        prop_assert_eq!(sent, words);
    }

    #[test]
    fn prop_split_is_deterministic(prompt in arb_prompt(), max in 1usize..40) {
        prop_assert_eq!(split(&prompt, max), split(&prompt, max));
    }
}
