// src/api.rs
use crate::analytics::{period_days, Analytics, DEFAULT_PERIOD_DAYS};
use crate::chat::ChatAssistant;
use crate::error::{handle_rejection, reject, ApiError};
use crate::ledger::Ledger;
use crate::market::{MarketService, DEFAULT_NEWS_COUNT};
use crate::models::{TransactionRequest, TransactionType};
use crate::streaming::PriceStreamer;
use crate::validators::validate_stock_symbol;
use crate::websocket::client_connection;
use chrono::Utc;
use log::{error, warn};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Shared services handed to every route.
#[derive(Clone)]
pub struct Services {
    pub ledger: Arc<Ledger>,
    pub analytics: Arc<Analytics>,
    pub market: Arc<MarketService>,
    pub streamer: Arc<PriceStreamer>,
    pub chat: Arc<ChatAssistant>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Deserialize)]
struct DaysQuery {
    days: Option<i64>,
}

#[derive(Deserialize)]
struct NewsQuery {
    count: Option<usize>,
}

#[derive(Deserialize)]
struct SymbolBody {
    symbol: Option<String>,
}

#[derive(Deserialize)]
struct ChatBody {
    message: Option<String>,
}

#[derive(Deserialize)]
struct SignOutBody {
    user_id: Option<String>,
}

fn fail(context: &str, err: impl Into<ApiError>) -> Rejection {
    let err = err.into();
    if err.status.is_server_error() {
        error!("{}: {}", context, err.message);
    } else {
        warn!("{}: {}", context, err.message);
    }
    reject(err)
}

pub fn routes(
    services: Services,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let create_transaction = warp::path!("api" / "transactions" / String)
        .and(warp::post())
        .and(warp::body::json())
        .and(with_ledger(services.ledger.clone()))
        .and(with_market(services.market.clone()))
        .and_then(create_transaction_handler);

    let transaction_history = warp::path!("api" / "transactions" / String)
        .and(warp::get())
        .and(warp::query::<HistoryQuery>())
        .and(with_ledger(services.ledger.clone()))
        .and_then(transaction_history_handler);

    let cash_balance = warp::path!("api" / "transactions" / String / "cash-balance")
        .and(warp::get())
        .and(with_ledger(services.ledger.clone()))
        .and_then(cash_balance_handler);

    let holding_quantity = warp::path!("api" / "transactions" / String / "holding" / String)
        .and(warp::get())
        .and(with_ledger(services.ledger.clone()))
        .and_then(holding_quantity_handler);

    let get_transaction = warp::path!("api" / "transactions" / String / "tx" / String)
        .and(warp::get())
        .and(with_ledger(services.ledger.clone()))
        .and_then(get_transaction_handler);

    let transactions = create_transaction
        .or(transaction_history)
        .or(cash_balance)
        .or(holding_quantity)
        .or(get_transaction);

    let portfolio = warp::path!("api" / "portfolio" / String)
        .and(warp::get())
        .and(with_analytics(services.analytics.clone()))
        .and_then(portfolio_handler);

    let holdings = warp::path!("api" / "holdings" / String)
        .and(warp::get())
        .and(with_analytics(services.analytics.clone()))
        .and_then(holdings_handler);

    let performance = warp::path!("api" / "performance" / String)
        .and(warp::get())
        .and(with_analytics(services.analytics.clone()))
        .and_then(performance_handler);

    let allocation = warp::path!("api" / "allocation" / String)
        .and(warp::get())
        .and(with_analytics(services.analytics.clone()))
        .and_then(allocation_handler);

    let summary = warp::path!("api" / "summary" / String)
        .and(warp::get())
        .and(with_analytics(services.analytics.clone()))
        .and_then(summary_handler);

    let performance_history = warp::path!("api" / "performance" / String / "history")
        .and(warp::get())
        .and(warp::query::<DaysQuery>())
        .and(with_analytics(services.analytics.clone()))
        .and_then(performance_history_handler);

    let chart = warp::path!("api" / "portfolio" / "chart" / String / String)
        .and(warp::get())
        .and(with_analytics(services.analytics.clone()))
        .and_then(chart_handler);

    let snapshot = warp::path!("api" / "portfolio" / "snapshot" / String)
        .and(warp::post())
        .and(with_analytics(services.analytics.clone()))
        .and_then(snapshot_handler);

    let analytics = portfolio
        .or(holdings)
        .or(performance)
        .or(allocation)
        .or(summary)
        .or(performance_history)
        .or(chart)
        .or(snapshot);

    let watchlist_get = warp::path!("api" / "watchlist" / String)
        .and(warp::get())
        .and(with_market(services.market.clone()))
        .and_then(watchlist_handler);

    let watchlist_add = warp::path!("api" / "watchlist" / String)
        .and(warp::post())
        .and(warp::body::json())
        .and(with_market(services.market.clone()))
        .and_then(watchlist_add_handler);

    let watchlist_remove = warp::path!("api" / "watchlist" / String / String)
        .and(warp::delete())
        .and(with_market(services.market.clone()))
        .and_then(watchlist_remove_handler);

    let price = warp::path!("api" / "market" / "price" / String)
        .and(warp::get())
        .and(with_market(services.market.clone()))
        .and_then(price_handler);

    let search = warp::path!("api" / "market" / "search" / String)
        .and(warp::get())
        .and(with_market(services.market.clone()))
        .and_then(search_handler);

    let news = warp::path!("api" / "market" / "news" / String)
        .and(warp::get())
        .and(warp::query::<NewsQuery>())
        .and(with_market(services.market.clone()))
        .and_then(news_handler);

    let refresh = warp::path!("api" / "market" / "prices" / "refresh" / String)
        .and(warp::post())
        .and(with_market(services.market.clone()))
        .and_then(refresh_prices_handler);

    let sectors = warp::path!("api" / "market" / "sectors" / "update" / String)
        .and(warp::post())
        .and(with_market(services.market.clone()))
        .and_then(update_sectors_handler);

    let market = watchlist_get
        .or(watchlist_add)
        .or(watchlist_remove)
        .or(price)
        .or(search)
        .or(news)
        .or(refresh)
        .or(sectors);

    let chat = warp::path!("api" / "chat" / String)
        .and(warp::post())
        .and(warp::body::json())
        .and(with_chat(services.chat.clone()))
        .and_then(chat_handler);

    let chat_history = warp::path!("api" / "chat" / String / "history")
        .and(warp::get())
        .and(with_chat(services.chat.clone()))
        .and_then(chat_history_handler);

    let chat_clear = warp::path!("api" / "chat" / String / "clear")
        .and(warp::post())
        .and(with_chat(services.chat.clone()))
        .and_then(chat_clear_handler);

    let sign_out = warp::path!("api" / "auth" / "signout")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_chat(services.chat.clone()))
        .and(with_streamer(services.streamer.clone()))
        .and_then(sign_out_handler);

    let ws = warp::path!("ws")
        .and(warp::ws())
        .and(with_streamer(services.streamer.clone()))
        .map(|ws: warp::ws::Ws, streamer: Arc<PriceStreamer>| {
            ws.on_upgrade(move |socket| client_connection(socket, streamer))
        });

    let assistant = chat.or(chat_history).or(chat_clear).or(sign_out);

    transactions
        .or(analytics)
        .or(market)
        .or(assistant)
        .or(ws)
        .recover(handle_rejection)
}

fn with_ledger(
    ledger: Arc<Ledger>,
) -> impl Filter<Extract = (Arc<Ledger>,), Error = Infallible> + Clone {
    warp::any().map(move || ledger.clone())
}

fn with_analytics(
    analytics: Arc<Analytics>,
) -> impl Filter<Extract = (Arc<Analytics>,), Error = Infallible> + Clone {
    warp::any().map(move || analytics.clone())
}

fn with_market(
    market: Arc<MarketService>,
) -> impl Filter<Extract = (Arc<MarketService>,), Error = Infallible> + Clone {
    warp::any().map(move || market.clone())
}

fn with_streamer(
    streamer: Arc<PriceStreamer>,
) -> impl Filter<Extract = (Arc<PriceStreamer>,), Error = Infallible> + Clone {
    warp::any().map(move || streamer.clone())
}

fn with_chat(
    chat: Arc<ChatAssistant>,
) -> impl Filter<Extract = (Arc<ChatAssistant>,), Error = Infallible> + Clone {
    warp::any().map(move || chat.clone())
}

async fn create_transaction_handler(
    user_id: String,
    request: TransactionRequest,
    ledger: Arc<Ledger>,
    market: Arc<MarketService>,
) -> Result<impl Reply, Rejection> {
    let transaction = ledger
        .process_transaction(&user_id, request)
        .await
        .map_err(|e| fail("Failed to create transaction", e))?;
    if matches!(
        transaction.transaction_type,
        TransactionType::Buy | TransactionType::Sell
    ) {
        market.ensure_asset(&transaction.symbol).await;
    }
    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "transaction": transaction })),
        StatusCode::CREATED,
    ))
}

async fn transaction_history_handler(
    user_id: String,
    query: HistoryQuery,
    ledger: Arc<Ledger>,
) -> Result<impl Reply, Rejection> {
    let transactions = ledger
        .transaction_history(
            &user_id,
            query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
            query.offset.unwrap_or(0),
        )
        .await
        .map_err(|e| fail("Failed to load transactions", e))?;
    Ok(warp::reply::json(&json!({ "transactions": transactions })))
}

async fn cash_balance_handler(
    user_id: String,
    ledger: Arc<Ledger>,
) -> Result<impl Reply, Rejection> {
    let cash_balance = ledger
        .get_cash_balance(&user_id)
        .await
        .map_err(|e| fail("Failed to load cash balance", e))?;
    Ok(warp::reply::json(&json!({ "cash_balance": cash_balance })))
}

async fn holding_quantity_handler(
    user_id: String,
    symbol: String,
    ledger: Arc<Ledger>,
) -> Result<impl Reply, Rejection> {
    let symbol = validate_stock_symbol(Some(&symbol)).map_err(|e| fail("Bad symbol", e))?;
    let quantity = ledger
        .get_holding_quantity(&user_id, &symbol)
        .await
        .map_err(|e| fail("Failed to load holding", e))?;
    Ok(warp::reply::json(
        &json!({ "symbol": symbol, "quantity": quantity }),
    ))
}

async fn get_transaction_handler(
    user_id: String,
    id: String,
    ledger: Arc<Ledger>,
) -> Result<impl Reply, Rejection> {
    let transaction = ledger
        .get_transaction(&user_id, &id)
        .await
        .map_err(|e| fail("Failed to load transaction", e))?;
    Ok(warp::reply::json(&json!({ "transaction": transaction })))
}

async fn portfolio_handler(
    user_id: String,
    analytics: Arc<Analytics>,
) -> Result<impl Reply, Rejection> {
    let details = analytics
        .portfolio(&user_id)
        .await
        .map_err(|e| fail("Failed to load portfolio", e))?;
    Ok(warp::reply::json(&details))
}

async fn holdings_handler(
    user_id: String,
    analytics: Arc<Analytics>,
) -> Result<impl Reply, Rejection> {
    let holdings = analytics
        .holdings(&user_id)
        .await
        .map_err(|e| fail("Failed to load holdings", e))?;
    Ok(warp::reply::json(&json!({ "holdings": holdings })))
}

async fn performance_handler(
    user_id: String,
    analytics: Arc<Analytics>,
) -> Result<impl Reply, Rejection> {
    let performance = analytics
        .performance(&user_id)
        .await
        .map_err(|e| fail("Failed to compute performance", e))?;
    Ok(warp::reply::json(&json!({ "performance": performance })))
}

async fn allocation_handler(
    user_id: String,
    analytics: Arc<Analytics>,
) -> Result<impl Reply, Rejection> {
    let allocation = analytics
        .allocation(&user_id)
        .await
        .map_err(|e| fail("Failed to compute allocation", e))?;
    Ok(warp::reply::json(&json!({ "allocation": allocation })))
}

async fn summary_handler(
    user_id: String,
    analytics: Arc<Analytics>,
) -> Result<impl Reply, Rejection> {
    let summary = analytics
        .summary(&user_id)
        .await
        .map_err(|e| fail("Failed to build summary", e))?;
    Ok(warp::reply::json(&summary))
}

async fn performance_history_handler(
    user_id: String,
    query: DaysQuery,
    analytics: Arc<Analytics>,
) -> Result<impl Reply, Rejection> {
    let days = query.days.unwrap_or(DEFAULT_PERIOD_DAYS);
    let history = analytics
        .historical_performance(&user_id, days)
        .await
        .map_err(|e| fail("Failed to compute historical performance", e))?;
    Ok(warp::reply::json(&history))
}

async fn chart_handler(
    user_id: String,
    period: String,
    analytics: Arc<Analytics>,
) -> Result<impl Reply, Rejection> {
    let chart = analytics
        .chart(&user_id, &period)
        .await
        .map_err(|e| fail("Failed to load chart", e))?;
    Ok(warp::reply::json(&json!({
        "chart_data": chart.chart_data,
        "period": period,
        "days": period_days(&period),
    })))
}

async fn snapshot_handler(
    user_id: String,
    analytics: Arc<Analytics>,
) -> Result<impl Reply, Rejection> {
    let snapshot = analytics
        .store_snapshot(&user_id, None, None)
        .await
        .map_err(|e| fail("Failed to store snapshot", e))?;
    Ok(warp::reply::json(&json!({
        "portfolio_value": snapshot.total_value,
        "snapshot": snapshot,
        "timestamp": Utc::now(),
    })))
}

async fn watchlist_handler(
    user_id: String,
    market: Arc<MarketService>,
) -> Result<impl Reply, Rejection> {
    let watchlist = market
        .watchlist(&user_id)
        .await
        .map_err(|e| fail("Failed to load watchlist", e))?;
    Ok(warp::reply::json(&json!({ "watchlist": watchlist })))
}

async fn watchlist_add_handler(
    user_id: String,
    body: SymbolBody,
    market: Arc<MarketService>,
) -> Result<impl Reply, Rejection> {
    let symbol = body
        .symbol
        .ok_or_else(|| fail("Watchlist add", ApiError::bad_request("Symbol required")))?;
    let (symbol, added) = market
        .add_to_watchlist(&user_id, &symbol)
        .await
        .map_err(|e| fail("Failed to add to watchlist", e))?;
    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "symbol": symbol, "added": added })),
        StatusCode::CREATED,
    ))
}

async fn watchlist_remove_handler(
    user_id: String,
    symbol: String,
    market: Arc<MarketService>,
) -> Result<impl Reply, Rejection> {
    let removed = market
        .remove_from_watchlist(&user_id, &symbol)
        .await
        .map_err(|e| fail("Failed to remove from watchlist", e))?;
    Ok(warp::reply::json(
        &json!({ "symbol": symbol.to_uppercase(), "removed": removed }),
    ))
}

async fn price_handler(
    symbol: String,
    market: Arc<MarketService>,
) -> Result<impl Reply, Rejection> {
    let quote = market
        .current_price(&symbol)
        .await
        .map_err(|e| fail("Failed to get price", e))?;
    Ok(warp::reply::json(&json!({ "price_data": quote })))
}

async fn search_handler(
    query: String,
    market: Arc<MarketService>,
) -> Result<impl Reply, Rejection> {
    let results = market
        .search(&query)
        .await
        .map_err(|e| fail("Symbol search failed", e))?;
    Ok(warp::reply::json(&json!({ "results": results })))
}

async fn news_handler(
    symbol: String,
    query: NewsQuery,
    market: Arc<MarketService>,
) -> Result<impl Reply, Rejection> {
    let report = market
        .news(&symbol, query.count.unwrap_or(DEFAULT_NEWS_COUNT))
        .await
        .map_err(|e| fail("Failed to fetch news", e))?;
    Ok(warp::reply::json(&report))
}

async fn refresh_prices_handler(
    user_id: String,
    market: Arc<MarketService>,
) -> Result<impl Reply, Rejection> {
    let updated = market
        .refresh_prices(&user_id)
        .await
        .map_err(|e| fail("Failed to refresh prices", e))?;
    Ok(warp::reply::json(&json!({
        "message": format!("Updated prices for {} symbols", updated),
        "updated_count": updated,
        "timestamp": Utc::now(),
    })))
}

async fn update_sectors_handler(
    user_id: String,
    market: Arc<MarketService>,
) -> Result<impl Reply, Rejection> {
    let updated = market
        .update_sectors(&user_id)
        .await
        .map_err(|e| fail("Failed to update sectors", e))?;
    Ok(warp::reply::json(&json!({
        "message": format!("Updated sector info for {} symbols", updated),
        "updated_count": updated,
        "timestamp": Utc::now(),
    })))
}

async fn chat_handler(
    user_id: String,
    body: ChatBody,
    chat: Arc<ChatAssistant>,
) -> Result<impl Reply, Rejection> {
    let message = body
        .message
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| fail("Chat", ApiError::bad_request("Message is required")))?;
    let reply = chat
        .chat(&user_id, &message)
        .await
        .map_err(|e| fail("Chat failed", e))?;
    Ok(warp::reply::json(&reply))
}

async fn chat_history_handler(
    user_id: String,
    chat: Arc<ChatAssistant>,
) -> Result<impl Reply, Rejection> {
    let history = chat.sessions().history(&user_id);
    Ok(warp::reply::json(&json!({ "history": history })))
}

async fn chat_clear_handler(
    user_id: String,
    chat: Arc<ChatAssistant>,
) -> Result<impl Reply, Rejection> {
    chat.sessions().clear(&user_id);
    Ok(warp::reply::json(&json!({
        "success": true,
        "message": "Chat history cleared",
    })))
}

async fn sign_out_handler(
    body: SignOutBody,
    chat: Arc<ChatAssistant>,
    streamer: Arc<PriceStreamer>,
) -> Result<impl Reply, Rejection> {
    let user_id = body
        .user_id
        .filter(|u| !u.is_empty())
        .ok_or_else(|| fail("Sign out", ApiError::bad_request("User ID required")))?;
    chat.sessions().clear(&user_id);
    streamer.unsubscribe_user(&user_id);
    Ok(warp::reply::json(
        &json!({ "message": "Signed out successfully" }),
    ))
}
