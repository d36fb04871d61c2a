//! Server-side auction results
//!
//! An auction config carrying a server response skips local bidding and
//! scoring. The response is decoded, checked against local interest group
//! state and turned into an ordinary auction result.

use auction_types::{
    kanon_key_for_component, AuctionConfig, AuctionId, AuctionOutcome, AuctionResult,
    ServerResponseError, WinningAd,
};
use tracing::{info, warn};

use crate::auction::EngineContext;
use crate::traits::DecodedServerResponse;

/// Complete an auction from its encrypted server response.
pub(crate) async fn run_server_auction(
    engine: &EngineContext,
    id: AuctionId,
    config: &AuctionConfig,
) -> AuctionResult {
    match complete(engine, id, config).await {
        Ok(result) => result,
        Err(err) => {
            warn!(auction_id = %id, error = %err, "server auction response rejected");
            let mut result = AuctionResult::empty(id, AuctionOutcome::Failed);
            result.errors.push(err.to_string());
            result
        }
    }
}

async fn complete(
    engine: &EngineContext,
    id: AuctionId,
    config: &AuctionConfig,
) -> Result<AuctionResult, ServerResponseError> {
    let Some(server) = &config.server_response else {
        return Err(ServerResponseError::Malformed("no server response".into()));
    };
    let Some(decoder) = &engine.deps.server_decoder else {
        return Err(ServerResponseError::DecryptionFailed);
    };
    let decoded = decoder.decode(server.request_id, &server.response).await?;

    if decoded.is_chaff {
        info!(auction_id = %id, "server auction response is chaff");
        return Ok(AuctionResult::empty(id, AuctionOutcome::NoBids));
    }
    if decoded.seller != config.seller {
        return Err(ServerResponseError::SellerMismatch {
            expected: config.seller.clone(),
            actual: decoded.seller,
        });
    }

    let (winner, kanon_key) = verify_winner(engine, &decoded).await?;
    let group = winner.interest_group.clone();

    let mut result = AuctionResult::empty(id, AuctionOutcome::Won);
    result.errors = decoded.errors;
    let reporting = decoded.reporting;
    result.reports.report_urls = [
        reporting.seller_report_url,
        reporting.component_seller_report_url,
        reporting.buyer_report_url,
    ]
    .into_iter()
    .flatten()
    .collect();
    result.kanon_keys_to_join = std::iter::once(kanon_key)
        .chain(winner.ad_components.iter().map(|url| kanon_key_for_component(url)))
        .collect();

    let store = &engine.deps.store;
    store.record_bids(std::slice::from_ref(&group)).await;
    let ad_json = serde_json::json!({ "renderURL": winner.render_url }).to_string();
    store.record_win(&group, ad_json).await;

    result.winner = Some(winner);
    Ok(result)
}

/// Check that the winner names a local group and one of its ads. Returns
/// the winner and the k-anonymity key of its ad.
async fn verify_winner(
    engine: &EngineContext,
    decoded: &DecodedServerResponse,
) -> Result<(WinningAd, String), ServerResponseError> {
    let key = decoded
        .interest_group
        .clone()
        .ok_or_else(|| ServerResponseError::Malformed("missing interest group".into()))?;
    let render_url = decoded
        .render_url
        .clone()
        .ok_or_else(|| ServerResponseError::Malformed("missing render URL".into()))?;

    let groups = engine.deps.store.interest_groups_for_owner(&key.owner).await;
    let group = groups
        .iter()
        .find(|g| g.name == key.name)
        .ok_or_else(|| ServerResponseError::UnknownInterestGroup(key.clone()))?;
    let Some(ad) = group.find_ad(&render_url, None) else {
        return Err(ServerResponseError::UnknownAd {
            group: key,
            url: render_url,
        });
    };
    if let Some(url) = decoded
        .ad_components
        .iter()
        .find(|url| group.find_ad_component(url, None).is_none())
    {
        return Err(ServerResponseError::UnknownAd {
            group: key,
            url: url.clone(),
        });
    }

    let kanon_key = group.kanon_key_for_ad(&render_url);
    let winner = WinningAd {
        interest_group: key,
        ad_metadata: ad.metadata.clone(),
        render_url,
        ad_components: decoded.ad_components.clone(),
        bid: decoded.bid.unwrap_or(0.0),
        bid_currency: decoded.bid_currency.clone(),
        component_seller: decoded.component_seller.clone(),
    };
    Ok((winner, kanon_key))
}
