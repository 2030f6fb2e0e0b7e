use rand::seq::SliceRandom;

use super::ClientIdentity;

const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_6) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];

const DEFAULT_PLAYER_CLIENTS: [&str; 7] = [
    "web",
    "android",
    "ios",
    "mweb",
    "tv",
    "web_embedded",
    "android_embedded",
];

const MOBILE_PLAYER_CLIENTS: [&str; 3] = ["android", "ios", "mweb"];

/// Heuristics that make extractor traffic look like an ordinary browser.
/// Kept out of the retrieval core; only the extractor adapter consults it.
pub trait ClientDisguisePolicy: Send + Sync {
    fn user_agent(&self) -> String;

    fn headers(&self) -> Vec<(String, String)>;

    fn player_clients(&self, identity: ClientIdentity) -> Vec<&'static str>;
}

#[derive(Debug, Clone, Default)]
pub struct RotatingDisguise;

impl ClientDisguisePolicy for RotatingDisguise {
    fn user_agent(&self) -> String {
        USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0])
            .to_string()
    }

    fn headers(&self) -> Vec<(String, String)> {
        [
            (
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
            ),
            ("Accept-Language", "en-US,en;q=0.9"),
            ("Sec-Fetch-Mode", "navigate"),
            ("Sec-Fetch-Site", "none"),
            ("Sec-Fetch-Dest", "document"),
            ("Referer", "https://www.youtube.com/"),
            ("Origin", "https://www.youtube.com"),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
    }

    fn player_clients(&self, identity: ClientIdentity) -> Vec<&'static str> {
        match identity {
            ClientIdentity::Default => DEFAULT_PLAYER_CLIENTS.to_vec(),
            ClientIdentity::Mobile => MOBILE_PLAYER_CLIENTS.to_vec(),
        }
    }
}
