use axum::{
    http::header::CONTENT_TYPE,
    response::{Html, IntoResponse},
};

/// OpenAPI description of the REST surface, checked in next to the crate.
pub const SWAGGER_JSON: &str = include_str!("../../../docs/api.swagger.json");

const SWAGGER_UI: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>API Documentation</title>
  <link rel="stylesheet" type="text/css" href="https://unpkg.com/swagger-ui-dist@4.15.5/swagger-ui.css" />
  <style>
    html { box-sizing: border-box; overflow-y: scroll; }
    *, *:before, *:after { box-sizing: inherit; }
    body { margin: 0; background: #fafafa; }
  </style>
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@4.15.5/swagger-ui-bundle.js"></script>
  <script src="https://unpkg.com/swagger-ui-dist@4.15.5/swagger-ui-standalone-preset.js"></script>
  <script>
    window.onload = function () {
      window.ui = SwaggerUIBundle({
        url: '/swagger.json',
        dom_id: '#swagger-ui',
        deepLinking: true,
        presets: [SwaggerUIBundle.presets.apis, SwaggerUIStandalonePreset],
        plugins: [SwaggerUIBundle.plugins.DownloadUrl],
        layout: 'StandaloneLayout'
      });
    };
  </script>
</body>
</html>
"#;

pub async fn swagger_json() -> impl IntoResponse {
    ([(CONTENT_TYPE, "application/json")], SWAGGER_JSON)
}

pub async fn swagger_ui() -> Html<&'static str> {
    Html(SWAGGER_UI)
}
