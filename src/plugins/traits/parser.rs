use crate::models::DiscoveredProduct;

/// Turns one fetched category page into products. Implementations are
/// registered per store in the `ParserRegistry`.
pub trait CategoryParser: Send + Sync {
    fn store(&self) -> &str;

    fn parse(&self, html: &str, page_url: &str) -> Vec<DiscoveredProduct>;

    /// Absolute URL of the following results page, if the page has one.
    fn next_page_url(&self, _html: &str, _page_url: &str) -> Option<String> {
        None
    }
}
