use regex::Regex;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use url::Url;

use crate::models::DiscoveredProduct;
use crate::plugins::traits::CategoryParser;
use crate::utils::error::{AppError, Result};

const COMMON_SKU_PATTERNS: &[&str] = &[
    r"/dp/([A-Z0-9]{10})",
    r"/ip/([0-9]+)",
    r"/p/([A-Za-z0-9-]+)",
    r"/product/([0-9]+)",
    r"/([0-9]{6,})",
];

const MAX_TITLE_CHARS: usize = 200;

/// CSS selectors describing one store's category page layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectorProfile {
    pub store: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// One match per product card.
    pub item: String,
    pub title: String,
    pub link: String,
    pub price: String,
    #[serde(default)]
    pub original_price: Option<String>,
    #[serde(default)]
    pub msrp: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    /// Attribute on the product card holding the SKU, e.g. `data-sku-id`.
    #[serde(default)]
    pub sku_attr: Option<String>,
    /// Store-specific SKU patterns tried against the product link before the
    /// common ones. The first capture group is the SKU.
    #[serde(default)]
    pub sku_patterns: Vec<String>,
    #[serde(default)]
    pub next_page: Option<String>,
}

pub struct SelectorParser {
    store: String,
    base_url: Option<Url>,
    item: Selector,
    title: Selector,
    link: Selector,
    price: Selector,
    original_price: Option<Selector>,
    msrp: Option<Selector>,
    image: Option<Selector>,
    next_page: Option<Selector>,
    sku_attr: Option<String>,
    sku_patterns: Vec<Regex>,
    price_pattern: Regex,
}

impl SelectorParser {
    pub fn new(profile: &SelectorProfile) -> Result<Self> {
        let store = profile.store.to_lowercase();
        let invalid = |message: String| AppError::Parser {
            store: store.clone(),
            message,
        };

        let selector = |css: &str| {
            Selector::parse(css).map_err(|e| invalid(format!("invalid selector {:?}: {:?}", css, e)))
        };
        let optional = |css: &Option<String>| css.as_deref().map(selector).transpose();

        let base_url = profile
            .base_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| invalid(format!("invalid base_url: {}", e)))?;

        let sku_patterns = profile
            .sku_patterns
            .iter()
            .map(String::as_str)
            .chain(COMMON_SKU_PATTERNS.iter().copied())
            .map(|pattern| Regex::new(pattern).map_err(|e| invalid(format!("invalid sku pattern: {}", e))))
            .collect::<Result<Vec<_>>>()?;

        let price_pattern = Regex::new(r"(\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?)")
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            base_url,
            item: selector(&profile.item)?,
            title: selector(&profile.title)?,
            link: selector(&profile.link)?,
            price: selector(&profile.price)?,
            original_price: optional(&profile.original_price)?,
            msrp: optional(&profile.msrp)?,
            image: optional(&profile.image)?,
            next_page: optional(&profile.next_page)?,
            sku_attr: profile.sku_attr.clone(),
            sku_patterns,
            price_pattern,
            store,
        })
    }

    /// "$1,299.99" -> 1299.99. `None` when no number is present.
    pub fn parse_price(&self, text: &str) -> Option<Decimal> {
        let captures = self.price_pattern.captures(text)?;
        let digits = captures.get(1)?.as_str().replace(',', "");
        Decimal::from_str(&digits).ok()
    }

    pub fn extract_sku_from_url(&self, url: &str) -> Option<String> {
        self.sku_patterns
            .iter()
            .find_map(|pattern| pattern.captures(url))
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().to_string())
    }

    fn absolute(&self, href: &str, page_url: &str) -> Option<String> {
        let base = match &self.base_url {
            Some(base) => base.clone(),
            None => Url::parse(page_url).ok()?,
        };
        base.join(href).ok().map(String::from)
    }

    fn text_of(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
        let found = element.select(selector).next()?;
        let text = found.text().collect::<Vec<_>>().join(" ");
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        (!text.is_empty()).then_some(text)
    }

    fn price_of(&self, element: ElementRef<'_>, selector: Option<&Selector>) -> Option<Decimal> {
        Self::text_of(element, selector?).and_then(|text| self.parse_price(&text))
    }

    fn product_from(&self, card: ElementRef<'_>, page_url: &str) -> Option<DiscoveredProduct> {
        let title = Self::text_of(card, &self.title)?;
        let href = card.select(&self.link).next()?.value().attr("href")?;
        let url = self.absolute(href, page_url)?;

        let sku = self
            .sku_attr
            .as_deref()
            .and_then(|attr| card.value().attr(attr))
            .map(str::to_string)
            .filter(|sku| !sku.is_empty())
            .or_else(|| self.extract_sku_from_url(&url))?;

        let current_price = self.price_of(card, Some(&self.price))?;
        let image_url = self
            .image
            .as_ref()
            .and_then(|selector| card.select(selector).next())
            .and_then(|img| img.value().attr("src").or_else(|| img.value().attr("data-src")))
            .and_then(|src| self.absolute(src, page_url));

        Some(DiscoveredProduct {
            sku,
            store: self.store.clone(),
            title: title.chars().take(MAX_TITLE_CHARS).collect(),
            url,
            current_price,
            original_price: self.price_of(card, self.original_price.as_ref()),
            msrp: self.price_of(card, self.msrp.as_ref()),
            image_url,
        })
    }
}

impl CategoryParser for SelectorParser {
    fn store(&self) -> &str {
        &self.store
    }

    fn parse(&self, html: &str, page_url: &str) -> Vec<DiscoveredProduct> {
        let document = Html::parse_document(html);
        let mut skipped = 0;

        let products: Vec<_> = document
            .select(&self.item)
            .filter_map(|card| {
                let product = self.product_from(card, page_url);
                if product.is_none() {
                    skipped += 1;
                }
                product
            })
            .collect();

        if skipped > 0 {
            tracing::debug!("[{}] skipped {} incomplete product cards on {}", self.store, skipped, page_url);
        }
        products
    }

    fn next_page_url(&self, html: &str, page_url: &str) -> Option<String> {
        let selector = self.next_page.as_ref()?;
        let document = Html::parse_document(html);
        let href = document.select(selector).next()?.value().attr("href")?;
        self.absolute(href, page_url)
    }
}
