// GraphQL server implementation
// Wires the schema, the subscription protocols, /command and CORS into one axum app

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_graphql_axum::{GraphQLRequest, GraphQLResponse, GraphQLSubscription};
use axum::{
    extract::{ws::WebSocketUpgrade, FromRef, State},
    http::StatusCode,
    middleware,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router, Server,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::engine::{
    dispatcher::{Dispatcher, DispatcherConfig},
    events::EventBus,
    graphql::{create_schema, AppSchema},
    job_server::shutdown_signal,
    registry::{runtime_dir, APP_NAME},
    storage::{InMemoryStorage, TodoStorage},
    subscriptions::SubscriptionRegistry,
};
use crate::server::cors::{origin_guard, CorsConfig};
use crate::server::subscriptions::{handle_socket, SUBPROTOCOL};

/// GraphQL server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ip: String,
    pub port: u16,
    pub cors: CorsConfig,
    pub dispatcher: DispatcherConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port: 4000,
            cors: CorsConfig::default(),
            dispatcher: DispatcherConfig {
                runtime_dir: Some(runtime_dir(APP_NAME)),
                ..Default::default()
            },
        }
    }
}

/// Everything a request handler may need
#[derive(Clone)]
pub struct AppState {
    pub schema: AppSchema,
    pub events: EventBus,
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(storage: Arc<dyn TodoStorage>, dispatcher: Arc<Dispatcher>) -> Self {
        let events = EventBus::new(SubscriptionRegistry::new());
        let schema = create_schema(storage, events.clone(), dispatcher.clone());
        Self {
            schema,
            events,
            dispatcher,
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        self.events.registry()
    }
}

impl FromRef<AppState> for AppSchema {
    fn from_ref(state: &AppState) -> Self {
        state.schema.clone()
    }
}

/// Build the application router
///
/// | Route       | Method | Purpose                                            |
/// |-------------|--------|----------------------------------------------------|
/// | `/`         | GET    | `graphql-subscriptions` WebSocket, else GraphiQL   |
/// | `/graphql`  | GET    | `graphql-subscriptions` WebSocket, else GraphiQL   |
/// | `/graphql`  | POST   | GraphQL queries and mutations                      |
/// | `/ws`       | GET    | GraphQL over WebSocket (async-graphql)             |
/// | `/graphiql` | GET    | GraphiQL IDE                                       |
/// | `/command`  | POST   | Run a command on the next job worker               |
/// | `/health`   | GET    | Liveness check                                     |
pub fn build_router(state: AppState, cors: CorsConfig) -> Router {
    let cors = Arc::new(cors);
    let subscription_service = GraphQLSubscription::new(state.schema.clone());

    Router::new()
        .route("/", get(legacy_ws_or_graphiql))
        .route("/graphql", get(legacy_ws_or_graphiql).post(graphql_handler))
        .route_service("/ws", subscription_service)
        .route("/graphiql", get(graphiql))
        .route("/health", get(health_check))
        .merge(crate::api::routes(state.dispatcher.clone()))
        .with_state(state)
        .layer(cors.layer())
        .layer(middleware::from_fn_with_state(cors.clone(), origin_guard))
        .layer(TraceLayer::new_for_http())
}

/// GraphQL server
pub struct GraphQLServer {
    config: ServerConfig,
    storage: Arc<dyn TodoStorage>,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl GraphQLServer {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            storage: Arc::new(InMemoryStorage::seeded()),
            dispatcher: None,
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn TodoStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Application state and router for this configuration
    pub fn into_router(self) -> (AppState, Router) {
        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| Arc::new(Dispatcher::discover(self.config.dispatcher.clone())));
        let state = AppState::new(self.storage, dispatcher);
        let router = build_router(state.clone(), self.config.cors);
        (state, router)
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let addr: SocketAddr = format!("{}:{}", self.config.ip, self.config.port).parse()?;
        let port = self.config.port;
        let (state, app) = self.into_router();

        let workers = state.dispatcher.workers();
        info!("Job workers: {}", workers.len());
        for worker in &workers {
            info!("  {}", worker);
        }

        info!("GraphQL server running on http://localhost:{}", port);
        info!("GraphQL endpoint: http://localhost:{}/graphql", port);
        info!("Subscriptions: ws://localhost:{}/graphql ({})", port, SUBPROTOCOL);
        info!("GraphQL WebSocket: ws://localhost:{}/ws", port);

        Server::bind(&addr)
            .serve(app.into_make_service())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("GraphQL server stopped");
        Ok(())
    }
}

impl Default for GraphQLServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder that collects settings before starting the server
pub struct GraphQLServerBuilder {
    config: ServerConfig,
    storage: Option<Arc<dyn TodoStorage>>,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl GraphQLServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            storage: None,
            dispatcher: None,
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.config.ip = ip.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn with_cors(mut self, cors: CorsConfig) -> Self {
        self.config.cors = cors;
        self
    }

    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.config.dispatcher.timeout = timeout;
        self
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.config.dispatcher.runtime_dir = Some(dir.into());
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn TodoStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn build(self) -> GraphQLServer {
        let mut server = GraphQLServer::new().with_config(self.config);
        if let Some(storage) = self.storage {
            server = server.with_storage(storage);
        }
        if let Some(dispatcher) = self.dispatcher {
            server = server.with_dispatcher(dispatcher);
        }
        server
    }

    pub async fn build_and_run(self) -> Result<(), Box<dyn std::error::Error>> {
        self.build().run().await
    }
}

impl Default for GraphQLServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// GraphQL handler
async fn graphql_handler(State(schema): State<AppSchema>, req: GraphQLRequest) -> GraphQLResponse {
    schema.execute(req.into_inner()).await.into()
}

// WebSocket upgrade for the legacy protocol, GraphiQL for plain GETs
async fn legacy_ws_or_graphiql(
    State(state): State<AppState>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    match ws {
        Some(ws) => {
            let registry = state.registry().clone();
            ws.protocols([SUBPROTOCOL])
                .on_upgrade(move |socket| handle_socket(socket, registry, state.dispatcher))
        }
        None => graphiql().await.into_response(),
    }
}

// GraphiQL interface with WebSocket support
async fn graphiql() -> impl IntoResponse {
    Html(
        r#"
<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8">
    <meta name="robots" content="noindex">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>GraphQL Jobs</title>
    <style>
      body { height: 100%; margin: 0; width: 100%; overflow: hidden; }
      #graphiql { height: 100vh; }
    </style>
    <script crossorigin src="https://unpkg.com/react@18/umd/react.development.js"></script>
    <script crossorigin src="https://unpkg.com/react-dom@18/umd/react-dom.development.js"></script>
    <link rel="stylesheet" href="https://unpkg.com/graphiql@3/graphiql.min.css" />
  </head>
  <body>
    <div id="graphiql">Loading...</div>
    <script src="https://unpkg.com/graphiql@3/graphiql.min.js" type="application/javascript"></script>
    <script>
      const scheme = window.location.protocol === 'https:' ? 'wss' : 'ws';
      const fetcher = GraphiQL.createFetcher({
        url: '/graphql',
        subscriptionUrl: scheme + '://' + window.location.host + '/ws',
      });
      ReactDOM.createRoot(document.getElementById('graphiql')).render(
        React.createElement(GraphiQL, { fetcher, defaultEditorToolsVisibility: true })
      );
    </script>
  </body>
</html>
"#,
    )
}

// Health check endpoint
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "GraphQL Jobs server is running!")
}
