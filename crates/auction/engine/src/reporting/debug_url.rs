//! Debug report URL templating
//!
//! Debug reporting URLs may carry `${name}` placeholders in their query
//! string. Known placeholders are replaced with post-auction values; unknown
//! ones and anything outside the query are left untouched.

use auction_types::{
    currency_code, PostAuctionSignals, RejectReason, TopLevelSignals,
};
use url::Url;

/// Placeholder values for one debug report
#[derive(Clone, Debug, Default)]
pub struct DebugReportVars {
    vars: Vec<(&'static str, String)>,
}

impl DebugReportVars {
    pub fn new(signals: &PostAuctionSignals) -> Self {
        let mut vars = Self::default();
        vars.push("winningBid", fmt_number(signals.winning_bid));
        vars.push(
            "winningBidCurrency",
            currency_code(signals.winning_bid_currency.as_ref()).to_string(),
        );
        vars.push("madeWinningBid", signals.made_winning_bid.to_string());
        vars.push(
            "highestScoringOtherBid",
            fmt_number(signals.highest_scoring_other_bid),
        );
        vars.push(
            "highestScoringOtherBidCurrency",
            currency_code(signals.highest_scoring_other_bid_currency.as_ref()).to_string(),
        );
        vars.push(
            "madeHighestScoringOtherBid",
            signals.made_highest_scoring_other_bid.to_string(),
        );
        vars
    }

    /// Add the top-level auction's outcome, for reports from component auctions.
    pub fn with_top_level(mut self, top: &TopLevelSignals) -> Self {
        self.push("topLevelWinningBid", fmt_number(top.winning_bid));
        self.push(
            "topLevelWinningBidCurrency",
            currency_code(top.winning_bid_currency.as_ref()).to_string(),
        );
        self.push("topLevelMadeWinningBid", top.made_winning_bid.to_string());
        self
    }

    /// Add the bid's reject reason. Only bidder loss reports carry it.
    pub fn with_reject_reason(mut self, reason: RejectReason) -> Self {
        self.push("rejectReason", reason.as_str().to_string());
        self
    }

    fn push(&mut self, name: &'static str, value: String) {
        self.vars.push((name, value));
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }
}

fn fmt_number(value: f64) -> String {
    format!("{}", value)
}

/// Substitute known placeholders in the query of `template`.
///
/// Templates that do not parse as URLs, or carry no query, come back as-is.
pub fn substitute(template: &str, vars: &DebugReportVars) -> String {
    let Ok(mut url) = Url::parse(template) else {
        return template.to_string();
    };
    let Some(query) = url.query() else {
        return template.to_string();
    };
    if !query.contains("${") {
        return template.to_string();
    }
    let query = substitute_placeholders(query, vars);
    url.set_query(Some(&query));
    url.into()
}

fn substitute_placeholders(mut rest: &str, vars: &DebugReportVars) -> String {
    let mut out = String::with_capacity(rest.len());
    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        match vars.get(&after[..close]) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[open..open + 2 + close + 1]),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use auction_types::AdCurrency;

    use super::*;

    fn signals() -> PostAuctionSignals {
        PostAuctionSignals {
            winning_bid: 2.0,
            winning_bid_currency: Some(AdCurrency::new("USD").unwrap()),
            made_winning_bid: false,
            highest_scoring_other_bid: 1.5,
            highest_scoring_other_bid_currency: None,
            made_highest_scoring_other_bid: true,
        }
    }

    #[test]
    fn replaces_known_placeholders_in_query() {
        let vars = DebugReportVars::new(&signals());
        let url = substitute(
            "https://b.test/loss?wb=${winningBid}&c=${winningBidCurrency}&o=${highestScoringOtherBid}&oc=${highestScoringOtherBidCurrency}&m=${madeHighestScoringOtherBid}",
            &vars,
        );
        assert_eq!(url, "https://b.test/loss?wb=2&c=USD&o=1.5&oc=???&m=true");
    }

    #[test]
    fn path_and_fragment_are_untouched() {
        let vars = DebugReportVars::new(&signals());
        let url = substitute("https://b.test/${winningBid}/x?v=${winningBid}#${winningBid}", &vars);
        assert_eq!(url, "https://b.test/$%7BwinningBid%7D/x?v=2#${winningBid}");
        assert_eq!(substitute("https://b.test/${winningBid}", &vars), "https://b.test/${winningBid}");
    }

    #[test]
    fn question_mark_inside_fragment_is_not_a_query() {
        let vars = DebugReportVars::new(&signals());
        assert_eq!(
            substitute("https://a.test/p#frag?x=${winningBid}", &vars),
            "https://a.test/p#frag?x=${winningBid}"
        );
    }

    #[test]
    fn unparseable_templates_are_returned_unchanged() {
        let vars = DebugReportVars::new(&signals());
        assert_eq!(substitute("not a url?v=${winningBid}", &vars), "not a url?v=${winningBid}");
    }

    #[test]
    fn unknown_and_unterminated_placeholders_stay() {
        let vars = DebugReportVars::new(&signals());
        assert_eq!(
            substitute("https://b.test/?a=${nope}&b=${rejectReason}&c=${winningBid", &vars),
            "https://b.test/?a=${nope}&b=${rejectReason}&c=${winningBid"
        );
    }

    #[test]
    fn reject_reason_only_when_added() {
        let vars = DebugReportVars::new(&signals()).with_reject_reason(RejectReason::BidBelowAuctionFloor);
        assert_eq!(
            substitute("https://b.test/?r=${rejectReason}", &vars),
            "https://b.test/?r=bid-below-auction-floor"
        );
    }

    #[test]
    fn top_level_values() {
        let top = TopLevelSignals {
            winning_bid: 7.0,
            winning_bid_currency: None,
            made_winning_bid: true,
        };
        let vars = DebugReportVars::new(&signals()).with_top_level(&top);
        assert_eq!(
            substitute("https://c.test/?t=${topLevelWinningBid}&m=${topLevelMadeWinningBid}", &vars),
            "https://c.test/?t=7&m=true"
        );
    }
}
